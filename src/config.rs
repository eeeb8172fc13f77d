//! Pipeline configuration.
//!
//! Every field has a default, so a configuration file only needs to name
//! the values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::proxy::ProxyProtocol;
use crate::{PipelineError, Result};

/// Domains that are never scraped.
pub const DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "google.com",
    "youtube.com",
    "facebook.com",
    "twitter.com",
    "instagram.com",
    "linkedin.com",
    "pinterest.com",
    "tiktok.com",
    "reddit.com",
    "wikipedia.org",
    "yahoo.com",
    "bing.com",
    "amazon.com",
    "ebay.com",
    "netflix.com",
];

/// Longest accepted temporary ban, in seconds (30 days).
pub const MAX_BAN_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Backoff settings used by the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add up to a quarter of the delay as random jitter.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

/// Thresholds and weights that drive proxy health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures that move a healthy proxy to degraded.
    #[serde(default = "default_degrade_after")]
    pub degrade_after_failures: u32,
    /// Consecutive failures that temporarily ban a degraded proxy.
    #[serde(default = "default_ban_after")]
    pub ban_after_failures: u32,
    /// Length of a temporary ban in seconds.
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
    /// Consecutive successes that restore a degraded proxy.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
    /// Decay applied to the rolling counters on every outcome.
    #[serde(default = "default_decay")]
    pub decay: f64,
    /// Weight of the success rate in the health score.
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    /// Weight of the latency term in the health score.
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
    /// Latency at which the latency term is worth half its weight.
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: u64,
    /// Smoothing factor of the latency moving average.
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,
    /// Checks that pass slower than this are reported as slow.
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

impl HealthConfig {
    /// Returns the ban window as a chrono duration, capped at
    /// [`MAX_BAN_DURATION_SECS`].
    pub fn ban_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ban_duration_secs.min(MAX_BAN_DURATION_SECS) as i64)
    }

    /// Checks that thresholds and weights are usable.
    pub fn validate(&self) -> Result<()> {
        if self.ban_duration_secs > MAX_BAN_DURATION_SECS {
            return Err(PipelineError::InvalidConfig(format!(
                "ban_duration_secs must be at most {}",
                MAX_BAN_DURATION_SECS
            )));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(PipelineError::InvalidConfig(
                "decay must be in (0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.latency_smoothing) {
            return Err(PipelineError::InvalidConfig(
                "latency_smoothing must be in [0, 1]".to_string(),
            ));
        }
        let weights = [self.success_weight, self.latency_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PipelineError::InvalidConfig(
                "score weights must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degrade_after_failures: default_degrade_after(),
            ban_after_failures: default_ban_after(),
            ban_duration_secs: default_ban_duration_secs(),
            recovery_successes: default_recovery_successes(),
            decay: default_decay(),
            success_weight: default_success_weight(),
            latency_weight: default_latency_weight(),
            latency_reference_ms: default_latency_reference_ms(),
            latency_smoothing: default_latency_smoothing(),
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

/// Top-level configuration of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Attempts per unit of work before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Deadline for a single page fetch in seconds.
    #[serde(default = "default_timeout_secs")]
    pub page_load_timeout_secs: u64,
    /// Deadline for a single search API call in seconds.
    #[serde(default = "default_timeout_secs")]
    pub api_timeout_secs: u64,
    /// Deadline for parsing one round of pages in seconds.
    #[serde(default = "default_timeout_secs")]
    pub parse_timeout_secs: u64,
    /// Result pages requested from the search API per run.
    #[serde(default = "default_api_pages")]
    pub api_pages: u32,
    /// Maximum scraper/parser rounds per run.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Maximum pages scraped in one round.
    #[serde(default = "default_max_pages_per_round")]
    pub max_pages_per_round: usize,
    /// Route network stages through the proxy pool.
    #[serde(default = "default_true")]
    pub use_proxy: bool,
    /// Preferred proxy protocol, if any.
    #[serde(default)]
    pub protocol_preference: Option<ProxyProtocol>,
    /// Domains excluded from scraping.
    #[serde(default = "default_blocked_domains")]
    pub blocked_domains: Vec<String>,
    /// Retry backoff settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Proxy health settings.
    #[serde(default)]
    pub health: HealthConfig,
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would otherwise misbehave at run time.
    pub fn validate(&self) -> Result<()> {
        self.health.validate()?;
        if self.api_pages == 0 {
            return Err(PipelineError::InvalidConfig(
                "api_pages must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(PipelineError::InvalidConfig(
                "retry multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Sets the attempt cap.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets how many search API result pages a run requests.
    pub fn with_api_pages(mut self, pages: u32) -> Self {
        self.api_pages = pages;
        self
    }

    /// Sets the round cap.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    /// Enables or disables proxy usage.
    pub fn with_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    /// Sets the preferred proxy protocol.
    pub fn with_protocol_preference(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol_preference = Some(protocol);
        self
    }

    /// Replaces the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the health settings.
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Replaces the blocked domain list.
    pub fn with_blocked_domains(mut self, domains: Vec<String>) -> Self {
        self.blocked_domains = domains;
        self
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            page_load_timeout_secs: default_timeout_secs(),
            api_timeout_secs: default_timeout_secs(),
            parse_timeout_secs: default_timeout_secs(),
            api_pages: default_api_pages(),
            max_rounds: default_max_rounds(),
            max_pages_per_round: default_max_pages_per_round(),
            use_proxy: true,
            protocol_preference: None,
            blocked_domains: default_blocked_domains(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_api_pages() -> u32 {
    3
}

fn default_max_rounds() -> u32 {
    10
}

fn default_max_pages_per_round() -> usize {
    100
}

fn default_blocked_domains() -> Vec<String> {
    DEFAULT_BLOCKED_DOMAINS.iter().map(|d| d.to_string()).collect()
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_degrade_after() -> u32 {
    3
}

fn default_ban_after() -> u32 {
    6
}

fn default_ban_duration_secs() -> u64 {
    300
}

fn default_recovery_successes() -> u32 {
    2
}

fn default_decay() -> f64 {
    0.9
}

fn default_success_weight() -> f64 {
    0.7
}

fn default_latency_weight() -> f64 {
    0.3
}

fn default_latency_reference_ms() -> u64 {
    1000
}

fn default_latency_smoothing() -> f64 {
    0.3
}

fn default_slow_threshold_ms() -> u64 {
    5000
}
