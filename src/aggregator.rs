//! Link aggregation across parser rounds.

use std::collections::HashSet;

use crate::result::normalize_url;

/// Result of folding one parser round into the running total.
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub link_count: u32,
    pub goal_reached: bool,
    /// Links seen for the first time in this round.
    pub new_links: Vec<String>,
    pub description: String,
}

/// Accumulates distinct links and detects when the target is reached.
///
/// Parsers may report links already counted in earlier rounds, so links
/// are deduplicated by normalized URL and only new ones add to the count.
#[derive(Debug)]
pub struct ResultAggregator {
    sentence: String,
    target: u32,
    seen: HashSet<String>,
    links: Vec<String>,
}

impl ResultAggregator {
    pub fn new(sentence: impl Into<String>, target: u32) -> Self {
        Self {
            sentence: sentence.into(),
            target,
            seen: HashSet::new(),
            links: Vec::new(),
        }
    }

    /// Folds parser output into `previous`, returning the new count.
    pub fn fold(&mut self, previous: u32, parsed: &[String]) -> Fold {
        let mut new_links = Vec::new();
        for link in parsed {
            let normalized = normalize_url(link);
            if normalized.is_empty() {
                continue;
            }
            if self.seen.insert(normalized) {
                new_links.push(link.clone());
            }
        }
        self.links.extend(new_links.iter().cloned());

        let link_count = previous.saturating_add(new_links.len() as u32);
        let goal_reached = link_count >= self.target;
        Fold {
            link_count,
            goal_reached,
            description: self.describe(link_count),
            new_links,
        }
    }

    /// Human-readable progress summary.
    pub fn describe(&self, link_count: u32) -> String {
        let status = if link_count >= self.target {
            "goal reached"
        } else {
            "in progress"
        };
        format!(
            "Collected {} of {} links for \"{}\" ({})",
            link_count, self.target, self.sentence, status
        )
    }

    /// All distinct links in discovery order.
    pub fn links(&self) -> &[String] {
        &self.links
    }

    pub fn target(&self) -> u32 {
        self.target
    }
}
