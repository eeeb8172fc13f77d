//! Search query representation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{PipelineError, Result};

/// The unit of work: a search sentence and the number of links to collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: Uuid,
    /// The search terms.
    pub sentence: String,
    /// Number of distinct links the run should collect.
    pub target_link_count: u32,
    /// Links collected so far. Never decreases.
    collected_link_count: u32,
    /// Human-readable summary of the last run.
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft delete marker.
    deleted: bool,
}

impl SearchQuery {
    /// Creates a query. Fails on an empty sentence or a zero target.
    pub fn new(sentence: impl Into<String>, target_link_count: u32) -> Result<Self> {
        let sentence = sentence.into().trim().to_string();
        if sentence.is_empty() {
            return Err(PipelineError::InvalidQuery(
                "Sentence cannot be empty".into(),
            ));
        }
        if target_link_count == 0 {
            return Err(PipelineError::InvalidQuery(
                "Target link count must be positive".into(),
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            sentence,
            target_link_count,
            collected_link_count: 0,
            description: None,
            created_at: now,
            updated_at: now,
            deleted: false,
        })
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn collected_link_count(&self) -> u32 {
        self.collected_link_count
    }

    /// Returns whether the collected count has reached the target.
    pub fn is_goal_reached(&self) -> bool {
        self.collected_link_count >= self.target_link_count
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Soft-deletes the query. Queries are never removed.
    pub fn mark_deleted(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.updated_at = Utc::now();
        }
    }

    /// Stores aggregated progress. A lower count than the current one is
    /// ignored.
    pub(crate) fn record_progress(&mut self, collected: u32, description: String) {
        self.collected_link_count = self.collected_link_count.max(collected);
        self.description = Some(description);
        self.updated_at = Utc::now();
    }
}

/// Creation request for a [`SearchQuery`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSearchQuery {
    pub sentence: String,
    pub target_link_count: u32,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewSearchQuery {
    pub fn new(sentence: impl Into<String>, target_link_count: u32) -> Self {
        Self {
            sentence: sentence.into(),
            target_link_count,
            description: None,
        }
    }
}

impl TryFrom<NewSearchQuery> for SearchQuery {
    type Error = PipelineError;

    fn try_from(request: NewSearchQuery) -> Result<Self> {
        let query = SearchQuery::new(request.sentence, request.target_link_count)?;
        Ok(match request.description {
            Some(description) => query.with_description(description),
            None => query,
        })
    }
}
