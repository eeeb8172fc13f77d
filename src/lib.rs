//! # mailmine-scrape
//!
//! A scrape pipeline orchestrator backed by a health-aware proxy pool.
//!
//! A run takes a search sentence and a target link count, calls a search
//! API, then alternates scraper and parser rounds until enough distinct
//! links are collected. Every network attempt goes through a proxy chosen
//! by health score, and its outcome feeds back into that proxy's health.
//!
//! - Pause, resume, skip and cancel, honoured between attempts
//! - Exponential backoff with jitter, rotating proxies on retry
//! - Temporary proxy bans with automatic re-admission
//! - HTTP(S), SOCKS and V2Ray-family proxy records
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mailmine_scrape::{
//!     stages::{http_stages, SearchApiCaller},
//!     NewSearchQuery, Orchestrator, PipelineConfig, ProxyPool, ProxyRecord,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = ProxyPool::default();
//!     pool.add(ProxyRecord::from_link("socks5://127.0.0.1:1080")?).await;
//!
//!     let api = SearchApiCaller::new(
//!         "https://www.googleapis.com/customsearch/v1",
//!         "API_KEY",
//!         "ENGINE_ID",
//!     );
//!     let config = PipelineConfig::default();
//!     let orchestrator = Orchestrator::new(http_stages(api, &config), Arc::new(pool))
//!         .with_config(config);
//!
//!     let run_id = orchestrator
//!         .submit(NewSearchQuery::new("dental clinics in lyon", 50))
//!         .await?;
//!     let outcome = orchestrator.wait(run_id).await?;
//!     println!("{}", outcome.description);
//!     Ok(())
//! }
//! ```

mod aggregator;
mod config;
mod domain;
mod error;
mod events;
mod executor;
mod orchestrator;
mod query;
mod result;
mod retry;
mod run;
mod state;

pub mod proxy;
pub mod stages;

pub use aggregator::{Fold, ResultAggregator};
pub use config::{
    HealthConfig, PipelineConfig, RetryConfig, DEFAULT_BLOCKED_DOMAINS, MAX_BAN_DURATION_SECS,
};
pub use domain::DomainFilter;
pub use error::{FailureKind, PipelineError, Result};
pub use events::{BroadcastSink, EventSink, MemorySink, NoopSink};
pub use executor::{
    Attempt, AttemptHarness, AttemptOutcome, StageExecutor, StageInput, StageKind, StageOutput,
};
pub use orchestrator::Orchestrator;
pub use proxy::{ProxyPool, ProxyProtocol, ProxyRecord, ProxyStatus};
pub use query::{NewSearchQuery, SearchQuery};
pub use result::{
    normalize_url, CandidateLink, RunEvent, RunOutcome, RunStats, RunStatus, ScrapedPage,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use run::{Directive, PipelineRun, RunControl, Stages};
pub use state::{is_consistent, RunState, Stage};
