//! Stage payloads and run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::proxy::ProxyId;
use crate::state::{RunState, Stage};

/// A link returned by the search API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub url: String,
    pub title: String,
    /// 1-based rank in the API response.
    pub position: u32,
}

impl CandidateLink {
    pub fn new(url: impl Into<String>, title: impl Into<String>, position: u32) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            position,
        }
    }

    /// Returns the normalized URL used for deduplication.
    pub fn normalized_url(&self) -> String {
        normalize_url(&self.url)
    }
}

/// A fetched page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    /// HTTP status of the response.
    pub status: u16,
    pub body: String,
    /// Proxy the page was fetched through, if any.
    pub proxy_id: Option<ProxyId>,
    pub fetched_at: DateTime<Utc>,
}

impl ScrapedPage {
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status,
            body: body.into(),
            proxy_id: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_proxy(mut self, proxy_id: ProxyId) -> Self {
        self.proxy_id = Some(proxy_id);
        self
    }

    /// Returns whether the page carries usable content.
    pub fn has_content(&self) -> bool {
        (200..300).contains(&self.status) && !self.body.trim().is_empty()
    }
}

/// Normalizes a URL for deduplication: no scheme, no fragment, no
/// trailing slash, lowercase.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url);
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/')
        .to_lowercase()
}

/// A stage or state change of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: Uuid,
    pub stage: Stage,
    pub state: RunState,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// Current view of a run, as served to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub query_id: Uuid,
    pub stage: Stage,
    pub state: RunState,
    /// Attempts made for the current unit of work.
    pub attempt_count: u32,
    /// Current scraper/parser round, 0 before the first one.
    pub round: u32,
    pub collected_link_count: u32,
    pub target_link_count: u32,
    pub stage_entered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunStatus {
    pub fn to_event(&self) -> RunEvent {
        RunEvent {
            run_id: self.run_id,
            stage: self.stage,
            state: self.state,
            attempt_count: self.attempt_count,
            updated_at: self.updated_at,
        }
    }
}

/// Counters collected while a run executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub rounds: u32,
    pub candidate_links: usize,
    pub pages_scraped: usize,
    pub blocked_urls: usize,
    /// Failed attempts, retried or not.
    pub failed_attempts: u32,
    pub duration_ms: u64,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub query_id: Uuid,
    pub collected_link_count: u32,
    pub description: String,
    pub final_state: RunState,
    pub final_stage: Stage,
    /// Failure class when the run failed.
    pub cause: Option<FailureKind>,
    /// Error message when the run failed.
    pub error: Option<String>,
    /// Distinct links collected, in discovery order.
    pub links: Vec<String>,
    pub stats: RunStats,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.final_state == RunState::Completed
    }
}
