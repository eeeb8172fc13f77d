//! Run orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::events::{EventSink, NoopSink};
use crate::proxy::{ProxyHealthSnapshot, ProxyPool};
use crate::query::{NewSearchQuery, SearchQuery};
use crate::result::{RunOutcome, RunStatus};
use crate::run::{PipelineRun, RunControl, Stages};
use crate::{PipelineError, Result};

struct RunHandle {
    control: RunControl,
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<RunOutcome>,
}

/// Starts pipeline runs as independent tasks and routes control requests
/// to them. All runs share one proxy pool.
pub struct Orchestrator {
    stages: Stages,
    pool: Arc<ProxyPool>,
    config: PipelineConfig,
    sink: Arc<dyn EventSink>,
    runs: RwLock<HashMap<Uuid, RunHandle>>,
    refresh: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Creates an orchestrator with the default configuration.
    ///
    /// If the pool has a source, it is reloaded periodically for as long as
    /// the orchestrator lives.
    pub fn new(stages: Stages, pool: Arc<ProxyPool>) -> Self {
        let refresh = pool.spawn_refresh();
        Self {
            stages,
            pool,
            config: PipelineConfig::default(),
            sink: Arc::new(NoopSink),
            runs: RwLock::new(HashMap::new()),
            refresh,
        }
    }

    /// Sets the configuration used by runs started afterwards.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the sink receiving events of every run.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the shared proxy pool.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawns a run for `query` and returns its id.
    pub async fn start(&self, query: SearchQuery) -> Result<Uuid> {
        if query.is_deleted() {
            return Err(PipelineError::InvalidQuery(format!(
                "Query {} is deleted",
                query.id
            )));
        }

        let run = PipelineRun::new(query, self.stages.clone(), Arc::clone(&self.pool))
            .with_config(self.config.clone())
            .with_sink(Arc::clone(&self.sink));
        let run_id = run.id();
        let handle = RunHandle {
            control: run.control(),
            status: run.status(),
            task: tokio::spawn(run.execute()),
        };

        self.runs.write().await.insert(run_id, handle);
        info!("Started run {}", run_id);
        Ok(run_id)
    }

    /// Validates a creation request and starts a run for it.
    pub async fn submit(&self, request: NewSearchQuery) -> Result<Uuid> {
        let query = SearchQuery::try_from(request)?;
        self.start(query).await
    }

    /// Requests a pause. Returns false if nothing changed.
    pub async fn pause(&self, run_id: Uuid) -> Result<bool> {
        self.control(run_id, RunControl::pause).await
    }

    pub async fn resume(&self, run_id: Uuid) -> Result<bool> {
        self.control(run_id, RunControl::resume).await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<bool> {
        self.control(run_id, RunControl::cancel).await
    }

    /// Requests that the current step of the run be abandoned.
    pub async fn skip(&self, run_id: Uuid) -> Result<bool> {
        self.control(run_id, RunControl::skip).await
    }

    async fn control(&self, run_id: Uuid, request: fn(&RunControl) -> bool) -> Result<bool> {
        let runs = self.runs.read().await;
        let handle = runs.get(&run_id).ok_or(PipelineError::UnknownRun(run_id))?;
        if handle.status.borrow().state.is_finished() {
            return Ok(false);
        }
        let changed = request(&handle.control);
        debug!("Control request for run {} changed state: {}", run_id, changed);
        Ok(changed)
    }

    /// Returns the current status of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunStatus> {
        let runs = self.runs.read().await;
        let handle = runs.get(&run_id).ok_or(PipelineError::UnknownRun(run_id))?;
        let status = handle.status.borrow().clone();
        Ok(status)
    }

    /// Waits for a run to finish and forgets it.
    ///
    /// The run stays controllable while this is pending.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunOutcome> {
        let mut status = {
            let runs = self.runs.read().await;
            let handle = runs.get(&run_id).ok_or(PipelineError::UnknownRun(run_id))?;
            handle.status.clone()
        };
        if status.wait_for(|s| s.state.is_finished()).await.is_err() {
            debug!("Run {} stopped without a final status", run_id);
        }

        let handle = self
            .runs
            .write()
            .await
            .remove(&run_id)
            .ok_or(PipelineError::UnknownRun(run_id))?;
        handle
            .task
            .await
            .map_err(|e| PipelineError::Unexpected(format!("Run {} task failed: {}", run_id, e)))
    }

    /// Waits for every known run to finish and forgets them all.
    pub async fn wait_all(&self) -> Vec<(Uuid, Result<RunOutcome>)> {
        let handles: Vec<_> = self.runs.write().await.drain().collect();
        let waits = handles.into_iter().map(|(run_id, handle)| async move {
            let outcome = handle.task.await.map_err(|e| {
                PipelineError::Unexpected(format!("Run {} task failed: {}", run_id, e))
            });
            (run_id, outcome)
        });
        join_all(waits).await
    }

    /// Ids of runs that have not finished.
    pub async fn active_runs(&self) -> Vec<Uuid> {
        self.runs
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.status.borrow().state.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Health of every proxy in the shared pool.
    pub async fn proxy_health(&self) -> Vec<ProxyHealthSnapshot> {
        self.pool.snapshot().await
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }
}
