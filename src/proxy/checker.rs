//! Standalone proxy checks, outside of any pipeline run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::record::{ProxyHealthSnapshot, ProxyId, ProxyRecord};
use crate::executor::AttemptOutcome;
use crate::Result;

/// Sends one test request through a proxy.
///
/// Like a stage executor, a checker only reports; the pool records the
/// result.
#[async_trait]
pub trait ProxyChecker: Send + Sync {
    async fn check(&self, proxy: &ProxyRecord, deadline: Instant) -> Result<()>;
}

/// Result of checking one proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCheck {
    pub id: ProxyId,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    /// The check passed but took longer than the slow threshold.
    pub slow: bool,
    pub error: Option<String>,
    /// Health after the result was recorded.
    pub health: ProxyHealthSnapshot,
}

impl ProxyCheck {
    pub fn is_usable(&self) -> bool {
        self.outcome.is_success()
    }
}
