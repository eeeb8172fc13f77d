//! Pipeline run state machine.
//!
//! A [`PipelineRun`] drives one search query through the API caller, then
//! repeats scraper and parser rounds until the link target is reached or
//! the round cap is hit. Control requests arrive through a [`RunControl`]
//! and are honoured between attempts, never in the middle of one.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::ResultAggregator;
use crate::config::PipelineConfig;
use crate::domain::DomainFilter;
use crate::error::FailureKind;
use crate::events::{EventSink, NoopSink};
use crate::executor::{AttemptHarness, StageExecutor, StageInput, StageOutput};
use crate::proxy::{ProxyId, ProxyPool};
use crate::query::SearchQuery;
use crate::result::{normalize_url, RunOutcome, RunStats, RunStatus, ScrapedPage};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{is_consistent, RunState, Stage};
use crate::PipelineError;

/// Latest control request for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Run,
    Pause,
    Cancel,
    Skip,
}

/// Sends control requests to a run.
///
/// Every method returns whether the request changed anything; repeating a
/// request is a no-op. A cancel cannot be taken back.
#[derive(Debug, Clone)]
pub struct RunControl {
    sender: Arc<watch::Sender<Directive>>,
}

impl RunControl {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Directive::Run);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn pause(&self) -> bool {
        self.swap(Directive::Run, Directive::Pause)
    }

    pub fn resume(&self) -> bool {
        self.swap(Directive::Pause, Directive::Run)
    }

    /// Abandons the current step of the run.
    pub fn skip(&self) -> bool {
        self.swap(Directive::Run, Directive::Skip)
    }

    pub fn cancel(&self) -> bool {
        self.sender.send_if_modified(|directive| {
            if *directive == Directive::Cancel {
                return false;
            }
            *directive = Directive::Cancel;
            true
        })
    }

    /// Returns the pending directive.
    pub fn directive(&self) -> Directive {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Directive> {
        self.sender.subscribe()
    }

    fn acknowledge_skip(&self) {
        self.swap(Directive::Skip, Directive::Run);
    }

    fn swap(&self, from: Directive, to: Directive) -> bool {
        self.sender.send_if_modified(|directive| {
            if *directive != from {
                return false;
            }
            *directive = to;
            true
        })
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// The executors of a run, one per stage.
#[derive(Clone)]
pub struct Stages {
    pub api_caller: Arc<dyn StageExecutor>,
    pub scraper: Arc<dyn StageExecutor>,
    pub parser: Arc<dyn StageExecutor>,
}

impl Stages {
    pub fn new<A, S, P>(api_caller: A, scraper: S, parser: P) -> Self
    where
        A: StageExecutor + 'static,
        S: StageExecutor + 'static,
        P: StageExecutor + 'static,
    {
        Self {
            api_caller: Arc::new(api_caller),
            scraper: Arc::new(scraper),
            parser: Arc::new(parser),
        }
    }
}

/// Why the run loop stopped early.
enum Halt {
    Cancelled,
    Failed(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        Self::Failed(err)
    }
}

/// What a checkpoint tells the stage loop.
enum Flow {
    Continue,
    Skip,
}

/// Result of one unit of work (one API call, one page, one parse).
enum Unit {
    Done(StageOutput),
    Skipped,
    Blocked,
}

/// URLs still to scrape, in discovery order.
#[derive(Debug, Default)]
struct Frontier {
    seen: HashSet<String>,
    pending: VecDeque<String>,
}

impl Frontier {
    /// Queues unseen URLs and returns how many were new.
    fn extend<I: IntoIterator<Item = String>>(&mut self, urls: I) -> usize {
        let before = self.pending.len();
        for url in urls {
            if self.seen.insert(normalize_url(&url)) {
                self.pending.push_back(url);
            }
        }
        self.pending.len() - before
    }

    fn next_batch(&mut self, max: usize) -> Vec<String> {
        let take = max.min(self.pending.len());
        self.pending.drain(..take).collect()
    }
}

/// One execution of the pipeline for a search query.
pub struct PipelineRun {
    id: Uuid,
    query: SearchQuery,
    config: PipelineConfig,
    stages: Stages,
    harness: AttemptHarness,
    retry: RetryPolicy,
    control: RunControl,
    directives: watch::Receiver<Directive>,
    status: watch::Sender<RunStatus>,
    sink: Arc<dyn EventSink>,
    aggregator: ResultAggregator,
    stats: RunStats,
    stage: Stage,
    state: RunState,
    attempts: u32,
    round: u32,
    collected: u32,
    stage_entered_at: DateTime<Utc>,
    last_proxy: Option<ProxyId>,
}

impl PipelineRun {
    /// Creates a pending run with the default configuration.
    pub fn new(query: SearchQuery, stages: Stages, pool: Arc<ProxyPool>) -> Self {
        let config = PipelineConfig::default();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let control = RunControl::new();
        let directives = control.subscribe();
        let (status, _) = watch::channel(RunStatus {
            run_id: id,
            query_id: query.id,
            stage: Stage::Started,
            state: RunState::Pending,
            attempt_count: 0,
            round: 0,
            collected_link_count: query.collected_link_count(),
            target_link_count: query.target_link_count,
            stage_entered_at: now,
            updated_at: now,
        });
        let harness = build_harness(pool, &config);
        Self {
            id,
            aggregator: ResultAggregator::new(query.sentence.clone(), query.target_link_count),
            collected: query.collected_link_count(),
            query,
            retry: RetryPolicy::from_config(&config),
            config,
            stages,
            harness,
            control,
            directives,
            status,
            sink: Arc::new(NoopSink),
            stats: RunStats::default(),
            stage: Stage::Started,
            state: RunState::Pending,
            attempts: 0,
            round: 0,
            stage_entered_at: now,
            last_proxy: None,
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.harness = build_harness(Arc::clone(self.harness.pool()), &config);
        self.retry = RetryPolicy::from_config(&config);
        self.config = config;
        self
    }

    /// Sets where stage and state changes are published.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Returns a handle for pause, resume, skip and cancel requests.
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Returns a receiver that always holds the current status.
    pub fn status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Runs to completion, failure or cancellation.
    pub async fn execute(mut self) -> RunOutcome {
        let started = Instant::now();
        info!(run_id = %self.id, "Starting run for \"{}\"", self.query.sentence);
        self.publish();

        let result = self.drive().await;

        let (state, cause, error) = match result {
            Ok(()) => (RunState::Completed, None, None),
            Err(Halt::Cancelled) => (RunState::Cancelled, None, None),
            Err(Halt::Failed(err)) => {
                error!(
                    run_id = %self.id,
                    stage = %self.stage,
                    proxy_id = ?self.last_proxy,
                    "Run failed: {}",
                    err
                );
                (RunState::Failed, Some(err.kind()), Some(err.to_string()))
            }
        };

        let mut description = self.aggregator.describe(self.collected);
        match (&state, &error) {
            (RunState::Failed, Some(error)) => {
                description.push_str(&format!("; run failed: {}", error));
            }
            (RunState::Cancelled, _) => description.push_str("; run cancelled"),
            _ => {}
        }
        self.query.record_progress(self.collected, description.clone());
        self.stats.duration_ms = started.elapsed().as_millis() as u64;
        self.transition(state);

        info!(
            run_id = %self.id,
            "Run finished as {} with {} of {} links",
            state,
            self.collected,
            self.query.target_link_count
        );

        RunOutcome {
            run_id: self.id,
            query_id: self.query.id,
            collected_link_count: self.collected,
            description,
            final_state: self.state,
            final_stage: self.stage,
            cause,
            error,
            links: self.aggregator.links().to_vec(),
            stats: self.stats.clone(),
        }
    }

    async fn drive(&mut self) -> Result<(), Halt> {
        self.transition(RunState::Running);

        self.enter(Stage::ApiCallerStarted);
        let mut frontier = Frontier::default();
        self.search(&mut frontier).await?;
        self.enter(Stage::ApiCallerComplete);

        let parser = Arc::clone(&self.stages.parser);
        for round in 1..=self.config.max_rounds {
            let batch = frontier.next_batch(self.config.max_pages_per_round);
            if batch.is_empty() {
                info!(run_id = %self.id, "No pages left to scrape");
                break;
            }
            self.round = round;
            self.stats.rounds = round;

            self.enter(Stage::ScraperStarted);
            let pages = self.scrape(batch).await?;
            self.enter(Stage::ScraperComplete);

            self.enter(Stage::ParserStarted);
            let links = match self
                .run_unit(&parser, &StageInput::Pages(pages), self.config.parse_timeout())
                .await?
            {
                Unit::Done(StageOutput::Links(links)) => links,
                Unit::Done(_) => return Err(unexpected_output(parser.name()).into()),
                Unit::Skipped | Unit::Blocked => Vec::new(),
            };

            let fold = self.aggregator.fold(self.collected, &links);
            self.collected = fold.link_count;
            self.query.record_progress(fold.link_count, fold.description);
            frontier.extend(links);
            self.enter(Stage::ParserComplete);

            info!(
                run_id = %self.id,
                "Round {} collected {} new links ({} of {})",
                round,
                fold.new_links.len(),
                self.collected,
                self.query.target_link_count
            );
            if fold.goal_reached {
                return Ok(());
            }
        }

        Err(PipelineError::GoalUnreachable {
            collected: self.collected,
            target: self.query.target_link_count,
        }
        .into())
    }

    /// Requests result pages from the search API until the page budget is
    /// spent or a page brings no new candidates. A failure after the first
    /// page keeps what was already found.
    async fn search(&mut self, frontier: &mut Frontier) -> Result<(), Halt> {
        let api_caller = Arc::clone(&self.stages.api_caller);
        for page in 1..=self.config.api_pages.max(1) {
            let input = StageInput::Query {
                sentence: self.query.sentence.clone(),
                round: page,
            };
            let unit = match self
                .run_unit(&api_caller, &input, self.config.api_timeout())
                .await
            {
                Ok(unit) => unit,
                Err(Halt::Failed(err)) if page > 1 => {
                    warn!(run_id = %self.id, "Search page {} failed, keeping earlier pages: {}", page, err);
                    break;
                }
                Err(halt) => return Err(halt),
            };
            let candidates = match unit {
                Unit::Done(StageOutput::Candidates(candidates)) => candidates,
                Unit::Done(_) => return Err(unexpected_output(api_caller.name()).into()),
                Unit::Skipped | Unit::Blocked => break,
            };

            let added = frontier.extend(candidates.into_iter().map(|c| c.url));
            self.stats.candidate_links += added;
            debug!(run_id = %self.id, "Search page {} added {} candidates", page, added);
            if added == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn scrape(&mut self, batch: Vec<String>) -> Result<Vec<ScrapedPage>, Halt> {
        let scraper = Arc::clone(&self.stages.scraper);
        let timeout = self.config.page_load_timeout();
        let mut pages = Vec::with_capacity(batch.len());
        for url in batch {
            match self.run_unit(&scraper, &StageInput::Page { url }, timeout).await? {
                Unit::Done(StageOutput::Page(page)) => {
                    self.stats.pages_scraped += 1;
                    pages.push(page);
                }
                Unit::Done(_) => return Err(unexpected_output(scraper.name()).into()),
                Unit::Blocked => {}
                Unit::Skipped => break,
            }
        }
        Ok(pages)
    }

    /// Runs one unit of work with retries.
    async fn run_unit(
        &mut self,
        executor: &Arc<dyn StageExecutor>,
        input: &StageInput,
        timeout: Duration,
    ) -> Result<Unit, Halt> {
        if let Err(err) = self.harness.screen(input) {
            info!(run_id = %self.id, "Skipping target: {}", err);
            self.stats.blocked_urls += 1;
            return Ok(Unit::Blocked);
        }

        self.set_attempts(0);
        let mut avoid: Vec<ProxyId> = Vec::new();
        loop {
            if let Flow::Skip = self.checkpoint().await? {
                return Ok(Unit::Skipped);
            }

            self.set_attempts(self.attempts + 1);
            let (attempt, result) = self
                .harness
                .run_attempt(executor.as_ref(), input, timeout, &avoid)
                .await;
            if attempt.proxy_id.is_some() {
                self.last_proxy = attempt.proxy_id;
            }

            let err = match result {
                Ok(output) => return Ok(Unit::Done(output)),
                Err(err) => err,
            };
            if err.kind() == FailureKind::BlockedDomain {
                info!(run_id = %self.id, "Skipping target: {}", err);
                self.stats.blocked_urls += 1;
                return Ok(Unit::Blocked);
            }
            self.stats.failed_attempts += 1;

            match self.retry.decide(self.attempts, err.kind()) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        run_id = %self.id,
                        "{} attempt {} failed ({}), retrying in {:?}",
                        executor.name(),
                        self.attempts,
                        err,
                        delay
                    );
                    if let Some(id) = attempt.proxy_id {
                        if !avoid.contains(&id) {
                            avoid.push(id);
                        }
                    }
                    if let Flow::Skip = self.backoff(delay).await? {
                        return Ok(Unit::Skipped);
                    }
                }
                RetryDecision::GiveUp => return Err(Halt::Failed(err)),
            }
        }
    }

    /// Applies pending control requests. Blocks while the run is paused.
    async fn checkpoint(&mut self) -> Result<Flow, Halt> {
        loop {
            let directive = *self.directives.borrow_and_update();
            match directive {
                Directive::Run => {
                    if self.state == RunState::Paused {
                        info!(run_id = %self.id, "Run resumed");
                        self.transition(RunState::Running);
                    }
                    return Ok(Flow::Continue);
                }
                Directive::Pause => {
                    if self.state != RunState::Paused {
                        info!(run_id = %self.id, "Run paused at {}", self.stage);
                        self.transition(RunState::Paused);
                    }
                    if self.directives.changed().await.is_err() {
                        return Err(Halt::Cancelled);
                    }
                }
                Directive::Cancel => {
                    info!(run_id = %self.id, "Run cancelled at {}", self.stage);
                    return Err(Halt::Cancelled);
                }
                Directive::Skip => {
                    info!(run_id = %self.id, "Skipping rest of {}", self.stage);
                    self.control.acknowledge_skip();
                    self.transition(RunState::Skipping);
                    return Ok(Flow::Skip);
                }
            }
        }
    }

    /// Sleeps before a retry. Control requests cut the sleep short.
    async fn backoff(&mut self, delay: Duration) -> Result<Flow, Halt> {
        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => return Ok(Flow::Continue),
                changed = self.directives.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep_until(wake).await;
                        return Ok(Flow::Continue);
                    }
                    if let Flow::Skip = self.checkpoint().await? {
                        return Ok(Flow::Skip);
                    }
                }
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        if !self.stage.can_advance_to(stage) {
            warn!(
                run_id = %self.id,
                "Unexpected stage change {} -> {}",
                self.stage,
                stage
            );
        }
        debug!(run_id = %self.id, "Stage {} -> {}", self.stage, stage);
        self.stage = stage;
        self.stage_entered_at = Utc::now();
        self.attempts = 0;
        // a skipped step ends with its stage
        if self.state == RunState::Skipping && !stage.is_in_progress() {
            self.state = RunState::Running;
        }
        self.publish();
    }

    fn transition(&mut self, to: RunState) -> bool {
        if self.state == to {
            return false;
        }
        if !self.state.can_transition_to(to) || !is_consistent(self.stage, to) {
            warn!(
                run_id = %self.id,
                "Ignoring invalid state change {} -> {}",
                self.state,
                to
            );
            return false;
        }
        self.state = to;
        self.publish();
        true
    }

    fn set_attempts(&mut self, attempts: u32) {
        if self.attempts != attempts {
            self.attempts = attempts;
            self.publish();
        }
    }

    fn publish(&mut self) {
        debug_assert!(
            is_consistent(self.stage, self.state),
            "inconsistent run status {} / {}",
            self.stage,
            self.state
        );
        let status = RunStatus {
            run_id: self.id,
            query_id: self.query.id,
            stage: self.stage,
            state: self.state,
            attempt_count: self.attempts,
            round: self.round,
            collected_link_count: self.collected,
            target_link_count: self.query.target_link_count,
            stage_entered_at: self.stage_entered_at,
            updated_at: Utc::now(),
        };
        self.sink.publish(status.to_event());
        self.status.send_replace(status);
    }
}

fn build_harness(pool: Arc<ProxyPool>, config: &PipelineConfig) -> AttemptHarness {
    let filter = DomainFilter::new(&config.blocked_domains);
    AttemptHarness::new(pool, Arc::new(filter))
        .with_proxy(config.use_proxy)
        .with_preference(config.protocol_preference)
}

fn unexpected_output(name: &str) -> PipelineError {
    PipelineError::Unexpected(format!("{} returned output of the wrong kind", name))
}
