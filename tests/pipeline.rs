//! End-to-end pipeline scenarios with in-memory stages.
//!
//! Run with: `cargo test --test pipeline`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Semaphore};
use tokio::time::{timeout, Instant};
use tokio_test::assert_ok;

use mailmine_scrape::{
    is_consistent, CandidateLink, FailureKind, HealthConfig, MemorySink, NewSearchQuery,
    Orchestrator, PipelineConfig, PipelineError, PipelineRun, ProxyPool, ProxyProtocol,
    ProxyRecord, Result, RetryConfig, RunEvent, RunOutcome, RunState, RunStatus, ScrapedPage,
    SearchQuery, Stage, StageExecutor, StageInput, StageKind, StageOutput, Stages,
};

// ----- mock stages -----

struct StaticApi {
    urls: Vec<String>,
}

impl StaticApi {
    fn seed() -> Self {
        Self {
            urls: vec!["https://seed.example.com/".to_string()],
        }
    }

    fn with_urls(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
        }
    }
}

#[async_trait]
impl StageExecutor for StaticApi {
    fn kind(&self) -> StageKind {
        StageKind::ApiCaller
    }

    async fn execute(
        &self,
        _input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let candidates = self
            .urls
            .iter()
            .enumerate()
            .map(|(i, url)| CandidateLink::new(url.clone(), "", i as u32 + 1))
            .collect();
        Ok(StageOutput::Candidates(candidates))
    }
}

/// Serves `pages` pages of distinct results, rate limiting the first
/// request for page 2.
struct PagedApi {
    pages: u32,
    rounds: Arc<Mutex<Vec<u32>>>,
    throttled: AtomicBool,
}

impl PagedApi {
    fn new(pages: u32, rounds: Arc<Mutex<Vec<u32>>>) -> Self {
        Self {
            pages,
            rounds,
            throttled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StageExecutor for PagedApi {
    fn kind(&self) -> StageKind {
        StageKind::ApiCaller
    }

    async fn execute(
        &self,
        input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let StageInput::Query { round, .. } = input else {
            return Err(PipelineError::Unexpected("expected a query".into()));
        };
        self.rounds.lock().unwrap().push(*round);
        if *round == 2 && !self.throttled.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Network("HTTP 429 Too Many Requests".into()));
        }
        if *round > self.pages {
            return Ok(StageOutput::Candidates(Vec::new()));
        }
        let candidates = (0..2)
            .map(|i| {
                let url = format!("https://page{}-{}.example/", round, i);
                CandidateLink::new(url, "", (*round - 1) * 2 + i + 1)
            })
            .collect();
        Ok(StageOutput::Candidates(candidates))
    }
}

/// Scraper whose behaviour is scripted per test.
struct MockScraper {
    calls: Arc<AtomicUsize>,
    /// Number of leading calls that fail.
    failures: usize,
    error: fn() -> PipelineError,
    gate: Option<Arc<Semaphore>>,
}

impl MockScraper {
    fn ok(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            failures: 0,
            error: network_error,
            gate: None,
        }
    }

    fn failing(calls: Arc<AtomicUsize>, failures: usize, error: fn() -> PipelineError) -> Self {
        Self {
            failures,
            error,
            ..Self::ok(calls)
        }
    }

    fn gated(calls: Arc<AtomicUsize>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::ok(calls)
        }
    }
}

fn network_error() -> PipelineError {
    PipelineError::Network("connection reset".into())
}

#[async_trait]
impl StageExecutor for MockScraper {
    fn kind(&self) -> StageKind {
        StageKind::Scraper
    }

    async fn execute(
        &self,
        input: &StageInput,
        proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| PipelineError::Unexpected(e.to_string()))?;
            permit.forget();
        }
        if call < self.failures {
            return Err((self.error)());
        }
        let url = input.target_url().unwrap_or_default();
        let mut page = ScrapedPage::new(url, 200, "<html></html>");
        if let Some(proxy) = proxy {
            page = page.with_proxy(proxy.id);
        }
        Ok(StageOutput::Page(page))
    }
}

/// Rejects targets on one host the way a redirect into a blocked domain
/// would, and serves every other page.
struct RedirectingScraper {
    blocked_host: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageExecutor for RedirectingScraper {
    fn kind(&self) -> StageKind {
        StageKind::Scraper
    }

    async fn execute(
        &self,
        input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = input.target_url().unwrap_or_default();
        if url.contains(self.blocked_host) {
            return Err(PipelineError::BlockedDomain("https://www.facebook.com/".into()));
        }
        Ok(StageOutput::Page(ScrapedPage::new(url, 200, "<html></html>")))
    }
}

/// Reports a growing, cumulative link list: `step` links more per call.
struct CumulativeParser {
    step: usize,
    calls: Arc<AtomicUsize>,
}

impl CumulativeParser {
    fn new(step: usize) -> Self {
        Self {
            step,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl StageExecutor for CumulativeParser {
    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn uses_proxy(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        _input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let links = (0..self.step * n)
            .map(|i| format!("https://site{}.example.com/", i))
            .collect();
        Ok(StageOutput::Links(links))
    }
}

/// Reports one link per scraped page.
struct PageParser;

#[async_trait]
impl StageExecutor for PageParser {
    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn uses_proxy(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        let StageInput::Pages(pages) = input else {
            return Err(PipelineError::Unexpected("expected pages".into()));
        };
        let links = pages.iter().map(|p| format!("{}found", p.url)).collect();
        Ok(StageOutput::Links(links))
    }
}

struct BrokenParser {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageExecutor for BrokenParser {
    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn uses_proxy(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        _input: &StageInput,
        _proxy: Option<&ProxyRecord>,
        _deadline: Instant,
    ) -> Result<StageOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Unexpected("parser crashed".into()))
    }
}

// ----- helpers -----

fn proxy_pool(count: u16) -> Arc<ProxyPool> {
    let proxies = (0..count)
        .map(|i| ProxyRecord::standard(ProxyProtocol::Http, "127.0.0.1", 8080 + i).unwrap())
        .collect();
    Arc::new(ProxyPool::with_proxies(proxies, HealthConfig::default()))
}

fn fast_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(RetryConfig {
        base_delay_ms: 1,
        max_delay_ms: 2,
        multiplier: 2.0,
        jitter: false,
    })
}

fn slow_retry_config() -> PipelineConfig {
    PipelineConfig::default().with_retry(RetryConfig {
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        multiplier: 1.0,
        jitter: false,
    })
}

fn new_run(
    target: u32,
    stages: Stages,
    pool: Arc<ProxyPool>,
    config: PipelineConfig,
    sink: Arc<MemorySink>,
) -> PipelineRun {
    let query = SearchQuery::new("x", target).unwrap();
    PipelineRun::new(query, stages, pool)
        .with_config(config)
        .with_sink(sink)
}

async fn finish(task: tokio::task::JoinHandle<RunOutcome>) -> RunOutcome {
    let joined = assert_ok!(timeout(Duration::from_secs(5), task).await);
    assert_ok!(joined)
}

async fn wait_until(status: &mut watch::Receiver<RunStatus>, f: impl FnMut(&RunStatus) -> bool) {
    let waited = timeout(Duration::from_secs(5), status.wait_for(f)).await;
    assert!(matches!(waited, Ok(Ok(_))), "status condition never met");
}

/// Stages move forward one step at a time, looping only from the parser
/// back to the scraper, and every stage/state pair is consistent.
fn assert_valid_sequence(events: &[RunEvent]) {
    let mut stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
    stages.dedup();
    assert_eq!(stages.first(), Some(&Stage::Started));
    for pair in stages.windows(2) {
        assert!(
            pair[0].can_advance_to(pair[1]),
            "invalid stage change {} -> {}",
            pair[0],
            pair[1]
        );
    }
    for event in events {
        assert!(
            is_consistent(event.stage, event.state),
            "inconsistent {} / {}",
            event.stage,
            event.state
        );
    }
}

fn states(events: &[RunEvent]) -> Vec<RunState> {
    let mut states: Vec<RunState> = events.iter().map(|e| e.state).collect();
    states.dedup();
    states
}

// ----- scenarios -----

#[tokio::test]
async fn test_rounds_accumulate_until_goal() {
    let sink = Arc::new(MemorySink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::clone(&calls)),
        CumulativeParser::new(2),
    );
    let run = new_run(5, stages, proxy_pool(3), fast_config(), Arc::clone(&sink));
    let run_id = run.id();

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Completed);
    assert_eq!(outcome.final_stage, Stage::ParserComplete);
    assert_eq!(outcome.collected_link_count, 6);
    assert_eq!(outcome.stats.rounds, 3);
    assert!(outcome.cause.is_none());
    assert!(outcome.description.contains("Collected 6 of 5 links"));

    let events = sink.events_for(run_id);
    assert_valid_sequence(&events);
    let mut stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
    stages.dedup();
    let loops = stages
        .windows(2)
        .filter(|w| w[0] == Stage::ParserComplete && w[1] == Stage::ScraperStarted)
        .count();
    assert_eq!(loops, 2);
    assert_eq!(events.last().map(|e| e.state), Some(RunState::Completed));

    // seed page, then two new links per round
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_search_requests_later_pages() {
    let sink = Arc::new(MemorySink::new());
    let rounds = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        PagedApi::new(5, Arc::clone(&rounds)),
        MockScraper::ok(Arc::clone(&calls)),
        PageParser,
    );
    let config = fast_config().with_api_pages(3);
    let run = new_run(6, stages, proxy_pool(2), config, Arc::clone(&sink));
    let run_id = run.id();

    let outcome = run.execute().await;

    // page 2 was rate limited once and retried
    assert_eq!(*rounds.lock().unwrap(), vec![1, 2, 2, 3]);
    assert_eq!(outcome.stats.candidate_links, 6);
    assert_eq!(outcome.stats.failed_attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(outcome.final_state, RunState::Completed);
    assert!(outcome.links.contains(&"https://page3-1.example/found".to_string()));
    assert_valid_sequence(&sink.events_for(run_id));
}

#[tokio::test]
async fn test_search_stops_at_last_result_page() {
    let rounds = Arc::new(Mutex::new(Vec::new()));
    let stages = Stages::new(
        PagedApi::new(1, Arc::clone(&rounds)),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        PageParser,
    );
    let config = fast_config().with_api_pages(3);
    let run = new_run(2, stages, proxy_pool(1), config, Arc::new(MemorySink::new()));

    let outcome = run.execute().await;

    // page 2 came back empty, so page 3 was never requested
    assert_eq!(*rounds.lock().unwrap(), vec![1, 2, 2]);
    assert_eq!(outcome.stats.candidate_links, 2);
    assert_eq!(outcome.final_state, RunState::Completed);
}

#[tokio::test]
async fn test_all_proxies_failing_fails_run() {
    let sink = Arc::new(MemorySink::new());
    let pool = proxy_pool(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::failing(Arc::clone(&calls), usize::MAX, network_error),
        CumulativeParser::new(2),
    );
    let run = new_run(5, stages, Arc::clone(&pool), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::NetworkError));
    assert_eq!(outcome.final_stage, Stage::ScraperStarted);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.stats.failed_attempts, 3);

    let health = pool.snapshot().await;
    assert!(health.iter().all(|h| h.failure_count == 1));
    // two search pages plus three scraper attempts, all reported
    let samples: u64 = health.iter().map(|h| h.success_count + h.failure_count).sum();
    assert_eq!(samples, 5);
}

#[tokio::test]
async fn test_blocked_domain_skips_proxy_and_retry_budget() {
    let sink = Arc::new(MemorySink::new());
    let pool = proxy_pool(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::with_urls(&["https://www.facebook.com/acme"]),
        MockScraper::ok(Arc::clone(&calls)),
        PageParser,
    );
    let run = new_run(5, stages, Arc::clone(&pool), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.stats.blocked_urls, 1);
    assert_eq!(outcome.stats.failed_attempts, 0);
    // nothing left to scrape
    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::GoalUnreachable));

    // only the search pages touched the proxy; the second brought nothing new
    let health = &pool.snapshot().await[0];
    assert_eq!(health.success_count, 2);
    assert_eq!(health.failure_count, 0);
}

#[tokio::test]
async fn test_blocked_domain_does_not_stop_other_urls() {
    let sink = Arc::new(MemorySink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::with_urls(&["https://en.wikipedia.org/wiki/Dentist", "https://acme.example/"]),
        MockScraper::ok(Arc::clone(&calls)),
        PageParser,
    );
    let run = new_run(1, stages, proxy_pool(1), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.stats.blocked_urls, 1);
    assert_eq!(outcome.links, vec!["https://acme.example/found".to_string()]);
}

#[tokio::test]
async fn test_blocked_by_scraper_skips_url() {
    let sink = Arc::new(MemorySink::new());
    let pool = proxy_pool(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::with_urls(&["https://redirects.example/", "https://acme.example/"]),
        RedirectingScraper {
            blocked_host: "redirects.example",
            calls: Arc::clone(&calls),
        },
        PageParser,
    );
    let run = new_run(1, stages, Arc::clone(&pool), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Completed);
    assert!(outcome.cause.is_none());
    assert_eq!(outcome.stats.blocked_urls, 1);
    assert_eq!(outcome.stats.failed_attempts, 0);
    // one call per URL, no retry of the blocked one
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.links, vec!["https://acme.example/found".to_string()]);

    // the two search pages and the good page are the only health samples
    let health = &pool.snapshot().await[0];
    assert_eq!(health.success_count, 3);
    assert_eq!(health.failure_count, 0);
}

#[tokio::test]
async fn test_retry_recovers_from_transient_error() {
    let sink = Arc::new(MemorySink::new());
    let pool = proxy_pool(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::failing(Arc::clone(&calls), 1, || {
            PipelineError::Protocol("truncated body".into())
        }),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, Arc::clone(&pool), fast_config(), Arc::clone(&sink));
    let run_id = run.id();

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Completed);
    assert_eq!(outcome.stats.failed_attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let attempts: Vec<u32> = sink
        .events_for(run_id)
        .iter()
        .filter(|e| e.stage == Stage::ScraperStarted)
        .map(|e| e.attempt_count)
        .collect();
    assert!(attempts.contains(&2));
}

#[tokio::test]
async fn test_no_proxy_available_fails_immediately() {
    let sink = Arc::new(MemorySink::new());
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, proxy_pool(0), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::NoProxyAvailable));
    assert_eq!(outcome.final_stage, Stage::ApiCallerStarted);
    assert_eq!(outcome.stats.failed_attempts, 1);
}

#[tokio::test]
async fn test_direct_mode_needs_no_proxies() {
    let sink = Arc::new(MemorySink::new());
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        CumulativeParser::new(2),
    );
    let config = fast_config().with_proxy(false);
    let run = new_run(2, stages, proxy_pool(0), config, sink);

    let outcome = run.execute().await;
    assert_eq!(outcome.final_state, RunState::Completed);
}

#[tokio::test]
async fn test_round_cap_preserves_partial_count() {
    let sink = Arc::new(MemorySink::new());
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        CumulativeParser::new(2),
    );
    let config = fast_config().with_max_rounds(2);
    let run = new_run(100, stages, proxy_pool(2), config, sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::GoalUnreachable));
    assert_eq!(outcome.collected_link_count, 4);
    assert_eq!(outcome.links.len(), 4);
    assert!(outcome.description.contains("run failed"));
}

#[tokio::test]
async fn test_unexpected_error_is_fatal() {
    let sink = Arc::new(MemorySink::new());
    let parser_calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        BrokenParser {
            calls: Arc::clone(&parser_calls),
        },
    );
    let run = new_run(2, stages, proxy_pool(1), fast_config(), sink);

    let outcome = run.execute().await;

    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::Unexpected));
    assert_eq!(outcome.final_stage, Stage::ParserStarted);
    assert_eq!(parser_calls.load(Ordering::SeqCst), 1);
    assert!(outcome.error.unwrap().contains("parser crashed"));
}

#[tokio::test]
async fn test_pause_resume_without_attempt_changes_nothing() {
    let sink = Arc::new(MemorySink::new());
    let gate = Arc::new(Semaphore::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::gated(Arc::new(AtomicUsize::new(0)), Arc::clone(&gate)),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, proxy_pool(1), fast_config(), Arc::clone(&sink));
    let run_id = run.id();
    let control = run.control();
    let mut status = run.status();
    let task = tokio::spawn(run.execute());

    // the first page attempt is in flight, waiting on the gate
    wait_until(&mut status, |s| {
        s.stage == Stage::ScraperStarted && s.attempt_count == 1
    })
    .await;
    let before = status.borrow().clone();

    assert!(control.pause());
    assert!(control.resume());
    tokio::task::yield_now().await;

    let after = status.borrow().clone();
    assert_eq!(after.stage, before.stage);
    assert_eq!(after.attempt_count, before.attempt_count);

    gate.add_permits(1);
    let outcome = finish(task).await;
    assert_eq!(outcome.final_state, RunState::Completed);
    assert!(!states(&sink.events_for(run_id)).contains(&RunState::Paused));
}

#[tokio::test]
async fn test_pause_is_idempotent() {
    let sink = Arc::new(MemorySink::new());
    let gate = Arc::new(Semaphore::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::gated(Arc::new(AtomicUsize::new(0)), Arc::clone(&gate)),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, proxy_pool(1), fast_config(), Arc::clone(&sink));
    let run_id = run.id();
    let control = run.control();
    let mut status = run.status();
    let task = tokio::spawn(run.execute());

    wait_until(&mut status, |s| s.stage == Stage::ScraperStarted).await;
    assert!(control.pause());
    gate.add_permits(1);

    // the next checkpoint is before the parser attempt
    wait_until(&mut status, |s| s.state == RunState::Paused).await;
    assert!(!control.pause());
    tokio::task::yield_now().await;
    assert_eq!(status.borrow().stage, Stage::ParserStarted);

    let paused = sink
        .events_for(run_id)
        .iter()
        .filter(|e| e.state == RunState::Paused)
        .count();
    assert_eq!(paused, 1);

    assert!(control.resume());
    let outcome = finish(task).await;
    assert_eq!(outcome.final_state, RunState::Completed);

    let events = sink.events_for(run_id);
    assert_valid_sequence(&events);
    let observed = states(&events);
    assert_eq!(
        observed,
        vec![
            RunState::Pending,
            RunState::Running,
            RunState::Paused,
            RunState::Running,
            RunState::Completed
        ]
    );
}

#[tokio::test]
async fn test_cancel_preempts_backoff() {
    let sink = Arc::new(MemorySink::new());
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::failing(Arc::new(AtomicUsize::new(0)), usize::MAX, network_error),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, proxy_pool(3), slow_retry_config(), sink);
    let control = run.control();
    let mut status = run.status();
    let task = tokio::spawn(run.execute());

    wait_until(&mut status, |s| {
        s.stage == Stage::ScraperStarted && s.attempt_count == 1
    })
    .await;
    assert!(control.cancel());
    assert!(!control.cancel());

    // the retry delay is a minute; finishing now means the sleep was cut
    let outcome = finish(task).await;
    assert_eq!(outcome.final_state, RunState::Cancelled);
    assert!(outcome.cause.is_none());
    assert_eq!(outcome.stats.failed_attempts, 1);
}

#[tokio::test]
async fn test_pause_during_backoff_then_cancel() {
    let sink = Arc::new(MemorySink::new());
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::failing(Arc::new(AtomicUsize::new(0)), usize::MAX, network_error),
        CumulativeParser::new(2),
    );
    let run = new_run(2, stages, proxy_pool(3), slow_retry_config(), sink);
    let control = run.control();
    let mut status = run.status();
    let task = tokio::spawn(run.execute());

    wait_until(&mut status, |s| {
        s.stage == Stage::ScraperStarted && s.attempt_count == 1
    })
    .await;
    assert!(control.pause());
    wait_until(&mut status, |s| s.state == RunState::Paused).await;
    assert_eq!(status.borrow().attempt_count, 1);

    assert!(control.cancel());
    let outcome = finish(task).await;
    assert_eq!(outcome.final_state, RunState::Cancelled);
}

#[tokio::test]
async fn test_skip_abandons_current_step() {
    let sink = Arc::new(MemorySink::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::failing(Arc::clone(&calls), usize::MAX, network_error),
        PageParser,
    );
    let run = new_run(2, stages, proxy_pool(3), slow_retry_config(), Arc::clone(&sink));
    let run_id = run.id();
    let control = run.control();
    let mut status = run.status();
    let task = tokio::spawn(run.execute());

    wait_until(&mut status, |s| {
        s.stage == Stage::ScraperStarted && s.attempt_count == 1
    })
    .await;
    assert!(control.skip());

    let outcome = finish(task).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // the only page was skipped, so the parser found nothing
    assert_eq!(outcome.final_state, RunState::Failed);
    assert_eq!(outcome.cause, Some(FailureKind::GoalUnreachable));

    let events = sink.events_for(run_id);
    assert_valid_sequence(&events);
    let observed = states(&events);
    let skipping = observed
        .iter()
        .position(|s| *s == RunState::Skipping)
        .expect("run never entered SKIPPING");
    assert_eq!(observed[skipping + 1], RunState::Running);
}

#[tokio::test]
async fn test_concurrent_runs_share_pool() {
    let stages = Stages::new(
        StaticApi::seed(),
        MockScraper::ok(Arc::new(AtomicUsize::new(0))),
        PageParser,
    );
    let pool = proxy_pool(3);
    let sink = Arc::new(MemorySink::new());
    let orchestrator = Orchestrator::new(stages, Arc::clone(&pool))
        .with_config(fast_config())
        .with_sink(sink.clone());

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = assert_ok!(
            orchestrator
                .submit(NewSearchQuery::new(format!("query {}", i), 1))
                .await
        );
        ids.push(id);
    }

    let outcomes = orchestrator.wait_all().await;
    assert_eq!(outcomes.len(), 5);
    for (id, outcome) in outcomes {
        assert!(ids.contains(&id));
        let outcome = assert_ok!(outcome);
        assert_eq!(outcome.final_state, RunState::Completed);
        assert_valid_sequence(&sink.events_for(id));
    }

    // each run requested two search pages and scraped one page
    let samples: u64 = pool
        .snapshot()
        .await
        .iter()
        .map(|h| h.success_count + h.failure_count)
        .sum();
    assert_eq!(samples, 15);
}
