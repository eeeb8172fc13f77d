//! Stage executor trait and the per-attempt harness.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::DomainFilter;
use crate::error::FailureKind;
use crate::proxy::{ProxyId, ProxyPool, ProxyProtocol, ProxyRecord};
use crate::result::{CandidateLink, ScrapedPage};
use crate::state::Stage;
use crate::{PipelineError, Result};

/// The three stages of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ApiCaller,
    Scraper,
    Parser,
}

impl StageKind {
    /// Stage entered when work of this kind begins.
    pub fn started(self) -> Stage {
        match self {
            Self::ApiCaller => Stage::ApiCallerStarted,
            Self::Scraper => Stage::ScraperStarted,
            Self::Parser => Stage::ParserStarted,
        }
    }

    /// Stage entered when work of this kind is done.
    pub fn complete(self) -> Stage {
        match self {
            Self::ApiCaller => Stage::ApiCallerComplete,
            Self::Scraper => Stage::ScraperComplete,
            Self::Parser => Stage::ParserComplete,
        }
    }
}

/// Input handed to a stage executor.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// Search sentence for the API caller. `round` starts at 1.
    Query { sentence: String, round: u32 },
    /// One page for the scraper.
    Page { url: String },
    /// Scraped pages for the parser.
    Pages(Vec<ScrapedPage>),
}

impl StageInput {
    /// Target URL, for inputs that address one.
    pub fn target_url(&self) -> Option<&str> {
        match self {
            Self::Page { url } => Some(url),
            _ => None,
        }
    }
}

/// Output produced by a stage executor.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Candidates(Vec<CandidateLink>),
    Page(ScrapedPage),
    Links(Vec<String>),
}

/// One stage of the pipeline.
///
/// Implementations perform a single attempt. Retries, proxy selection,
/// deadlines and health reporting are handled by the caller, so an
/// executor must never touch proxy health itself.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Which stage this executor implements.
    fn kind(&self) -> StageKind;

    /// Whether attempts go through the proxy pool.
    fn uses_proxy(&self) -> bool {
        true
    }

    /// Runs one attempt. `deadline` is also enforced by the caller.
    async fn execute(
        &self,
        input: &StageInput,
        proxy: Option<&ProxyRecord>,
        deadline: Instant,
    ) -> Result<StageOutput>;

    /// Returns the executor name.
    fn name(&self) -> &str {
        match self.kind() {
            StageKind::ApiCaller => "api_caller",
            StageKind::Scraper => "scraper",
            StageKind::Parser => "parser",
        }
    }
}

/// How an attempt ended, as reported to the proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    NetworkError,
    BlockedDomain,
    ProtocolError,
    Other,
}

impl AttemptOutcome {
    /// Returns whether this outcome is a health sample for the proxy.
    pub fn affects_health(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Timeout | Self::NetworkError | Self::ProtocolError
        )
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<FailureKind> for AttemptOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => Self::Timeout,
            FailureKind::NetworkError => Self::NetworkError,
            FailureKind::BlockedDomain => Self::BlockedDomain,
            FailureKind::ProtocolError => Self::ProtocolError,
            FailureKind::NoProxyAvailable
            | FailureKind::GoalUnreachable
            | FailureKind::Unexpected => Self::Other,
        }
    }
}

/// Record of one executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub stage: StageKind,
    pub proxy_id: Option<ProxyId>,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

/// Runs single attempts: domain screening, proxy selection, deadline
/// enforcement and health reporting.
#[derive(Clone)]
pub struct AttemptHarness {
    pool: Arc<ProxyPool>,
    filter: Arc<DomainFilter>,
    use_proxy: bool,
    preference: Option<ProxyProtocol>,
}

impl AttemptHarness {
    pub fn new(pool: Arc<ProxyPool>, filter: Arc<DomainFilter>) -> Self {
        Self {
            pool,
            filter,
            use_proxy: true,
            preference: None,
        }
    }

    /// Disables proxies; attempts connect directly.
    pub fn with_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    pub fn with_preference(mut self, preference: Option<ProxyProtocol>) -> Self {
        self.preference = preference;
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Rejects inputs that target a blocked domain. No proxy is involved.
    pub fn screen(&self, input: &StageInput) -> Result<()> {
        match input.target_url() {
            Some(url) if self.filter.is_blocked(url) => {
                Err(PipelineError::BlockedDomain(url.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Runs one attempt of `executor`.
    ///
    /// Proxies in `avoid` are passed over when another one is eligible.
    /// When a proxy was used, the outcome is reported to the pool unless
    /// the executor itself rejected the target as blocked.
    pub async fn run_attempt(
        &self,
        executor: &dyn StageExecutor,
        input: &StageInput,
        timeout: Duration,
        avoid: &[ProxyId],
    ) -> (Attempt, Result<StageOutput>) {
        let kind = executor.kind();
        let started_at = Utc::now();

        if let Err(err) = self.screen(input) {
            let attempt = Attempt {
                stage: kind,
                proxy_id: None,
                outcome: AttemptOutcome::BlockedDomain,
                latency_ms: 0,
                at: started_at,
            };
            return (attempt, Err(err));
        }

        let proxy = if self.use_proxy && executor.uses_proxy() {
            match self.pool.select_proxy_avoiding(self.preference, avoid).await {
                Ok(proxy) => Some(proxy),
                Err(err) => {
                    let attempt = Attempt {
                        stage: kind,
                        proxy_id: None,
                        outcome: AttemptOutcome::Other,
                        latency_ms: 0,
                        at: started_at,
                    };
                    return (attempt, Err(err));
                }
            }
        } else {
            None
        };

        let start = Instant::now();
        let deadline = start + timeout;
        let result = match tokio::time::timeout_at(
            deadline,
            executor.execute(input, proxy.as_ref(), deadline),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout),
        };
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match &result {
            Ok(_) => AttemptOutcome::Success,
            Err(err) => AttemptOutcome::from(err.kind()),
        };

        if let Some(proxy) = &proxy {
            debug!(
                "{} attempt via {} ended with {:?} in {}ms",
                executor.name(),
                proxy.display_name(),
                outcome,
                latency_ms
            );
            // a blocked target says nothing about the proxy
            if outcome != AttemptOutcome::BlockedDomain {
                if let Err(err) = self.pool.record_outcome(proxy.id, outcome, latency_ms).await {
                    warn!("Could not record outcome for proxy {}: {}", proxy.id, err);
                }
            }
        }

        let attempt = Attempt {
            stage: kind,
            proxy_id: proxy.map(|p| p.id),
            outcome,
            latency_ms,
            at: started_at,
        };
        (attempt, result)
    }
}
