//! Error types for the scrape pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Classification of a failure, used by the retry policy and the run
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt deadline was exceeded.
    Timeout,
    /// Connection or transport failure.
    NetworkError,
    /// The target URL belongs to a blocked domain.
    BlockedDomain,
    /// The response could not be understood.
    ProtocolError,
    /// No eligible proxy in the pool.
    NoProxyAvailable,
    /// The round cap was hit before the link goal.
    GoalUnreachable,
    /// Anything else. Fatal for the run.
    Unexpected,
}

impl FailureKind {
    /// Returns whether a failure of this kind may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NetworkError | Self::ProtocolError
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::BlockedDomain => "blocked_domain",
            Self::ProtocolError => "protocol_error",
            Self::NoProxyAvailable => "no_proxy_available",
            Self::GoalUnreachable => "goal_unreachable",
            Self::Unexpected => "unexpected",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while running the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Attempt deadline exceeded.
    #[error("Attempt timed out")]
    Timeout,

    /// Connection or transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Target rejected by the domain blocklist.
    #[error("Blocked domain: {0}")]
    BlockedDomain(String),

    /// Malformed or unexpected response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No eligible proxy in the pool.
    #[error("No proxy available")]
    NoProxyAvailable,

    /// Round cap reached without hitting the target link count.
    #[error("Goal unreachable: collected {collected} of {target} links")]
    GoalUnreachable { collected: u32, target: u32 },

    /// Fatal error for the run.
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    /// Invalid search query.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid proxy definition.
    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    /// Configuration value out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No run registered under this id.
    #[error("Unknown run: {0}")]
    UnknownRun(Uuid),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Maps this error onto the failure taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::Network(_) => FailureKind::NetworkError,
            Self::BlockedDomain(_) => FailureKind::BlockedDomain,
            Self::Protocol(_) | Self::Json(_) | Self::InvalidProxy(_) => {
                FailureKind::ProtocolError
            }
            Self::NoProxyAvailable => FailureKind::NoProxyAvailable,
            Self::GoalUnreachable { .. } => FailureKind::GoalUnreachable,
            Self::Http(e) => classify_http(e),
            Self::Unexpected(_)
            | Self::InvalidQuery(_)
            | Self::InvalidConfig(_)
            | Self::UnknownRun(_)
            | Self::UrlParse(_)
            | Self::Io(_) => FailureKind::Unexpected,
        }
    }
}

fn classify_http(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        return FailureKind::Timeout;
    }
    if let Some(status) = err.status() {
        if status.as_u16() == 429 || status.is_server_error() {
            return FailureKind::NetworkError;
        }
        return FailureKind::ProtocolError;
    }
    if err.is_decode() || err.is_body() {
        return FailureKind::ProtocolError;
    }
    FailureKind::NetworkError
}
