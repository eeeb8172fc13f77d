//! Health-aware proxy pool.
//!
//! The pool hands out the best-scoring eligible proxy for each attempt and
//! is the only place proxy health changes. Every proxy sits behind its own
//! lock; the membership list is only write-locked by admin operations, so
//! concurrent runs never serialize on the whole pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::checker::{ProxyCheck, ProxyChecker};
use super::link::load_proxy_file;
use super::record::{ProxyHealth, ProxyHealthSnapshot, ProxyId, ProxyProtocol, ProxyRecord, ProxyStatus};
use crate::config::HealthConfig;
use crate::executor::AttemptOutcome;
use crate::{PipelineError, Result};

const SCORE_EPSILON: f64 = 1e-9;

/// Loads proxy records from storage.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Fetches the current list of proxies.
    async fn load_proxies(&self) -> Result<Vec<ProxyRecord>>;

    /// Returns how often the pool should reload.
    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// A source that always returns the same records.
pub struct StaticProxySource {
    proxies: Vec<ProxyRecord>,
}

impl StaticProxySource {
    pub fn new(proxies: Vec<ProxyRecord>) -> Self {
        Self { proxies }
    }
}

#[async_trait]
impl ProxySource for StaticProxySource {
    async fn load_proxies(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self.proxies.clone())
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(u64::MAX)
    }
}

/// Reads share links from a proxy list file on every refresh.
pub struct FileProxySource {
    path: PathBuf,
    interval: Duration,
}

impl FileProxySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            interval: Duration::from_secs(300),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl ProxySource for FileProxySource {
    async fn load_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_proxy_file(path))
            .await
            .map_err(|e| PipelineError::Unexpected(format!("Proxy file reader failed: {}", e)))?
    }

    fn refresh_interval(&self) -> Duration {
        self.interval
    }
}

struct PoolEntry {
    id: ProxyId,
    record: Mutex<ProxyRecord>,
}

impl PoolEntry {
    fn new(record: ProxyRecord) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            record: Mutex::new(record),
        })
    }
}

/// A pool of proxies with live health tracking.
pub struct ProxyPool {
    entries: RwLock<Vec<Arc<PoolEntry>>>,
    source: Option<Arc<dyn ProxySource>>,
    health: HealthConfig,
}

impl ProxyPool {
    /// Creates an empty pool.
    pub fn new(health: HealthConfig) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            source: None,
            health,
        }
    }

    /// Creates a pool holding the given proxies.
    pub fn with_proxies(proxies: Vec<ProxyRecord>, health: HealthConfig) -> Self {
        Self {
            entries: RwLock::new(proxies.into_iter().map(PoolEntry::new).collect()),
            source: None,
            health,
        }
    }

    /// Attaches a source used by [`ProxyPool::refresh`].
    pub fn with_source<S: ProxySource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the health settings of this pool.
    pub fn health_config(&self) -> &HealthConfig {
        &self.health
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn entries(&self) -> Vec<Arc<PoolEntry>> {
        self.entries.read().await.clone()
    }

    async fn entry(&self, id: ProxyId) -> Option<Arc<PoolEntry>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Adds a proxy, or replaces the configuration of the proxy with the
    /// same id while keeping its health.
    pub async fn add(&self, record: ProxyRecord) -> ProxyId {
        let id = record.id;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter().find(|e| e.id == id) {
            replace_keeping_health(&mut *entry.record.lock().await, record);
            return id;
        }
        entries.push(PoolEntry::new(record));
        debug!("Added proxy {}", id);
        id
    }

    /// Replaces the configuration of an existing proxy. Health is kept.
    pub async fn update(&self, record: ProxyRecord) -> Result<()> {
        let entry = self
            .entry(record.id)
            .await
            .ok_or_else(|| unknown_proxy(record.id))?;
        replace_keeping_health(&mut *entry.record.lock().await, record);
        Ok(())
    }

    /// Removes a proxy. Returns whether it was present.
    pub async fn remove(&self, id: ProxyId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Returns a copy of a proxy record.
    pub async fn get(&self, id: ProxyId) -> Option<ProxyRecord> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await.clone();
        Some(record)
    }

    /// Reloads the proxy list from the attached source.
    ///
    /// Proxies matching an existing one by id, or by host and port, keep
    /// their health. Proxies missing from the source are dropped.
    pub async fn refresh(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(self.len().await);
        };
        let fresh = source.load_proxies().await?;

        let mut entries = self.entries.write().await;
        let mut known = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let record = entry.record.lock().await;
            known.push((record.id, record.host.clone(), record.port, record.health().clone()));
        }

        let mut merged = Vec::with_capacity(fresh.len());
        for mut record in fresh {
            let previous = known.iter().find(|(id, host, port, _)| {
                *id == record.id || (*host == record.host && *port == record.port)
            });
            if let Some((id, _, _, health)) = previous {
                record.id = *id;
                *record.health_mut() = health.clone();
            }
            merged.push(PoolEntry::new(record));
        }
        *entries = merged;
        info!("Refreshed proxy pool with {} proxies", entries.len());
        Ok(entries.len())
    }

    /// Reloads from the attached source every
    /// [`ProxySource::refresh_interval`] until the pool is dropped.
    ///
    /// Returns `None` when there is no source, its interval is too long to
    /// schedule, or no Tokio runtime is running.
    pub fn spawn_refresh(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.source.as_ref()?.refresh_interval();
        if interval.is_zero() || Instant::now().checked_add(interval).is_none() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let pool: Weak<Self> = Arc::downgrade(self);
        info!("Refreshing proxy pool every {:?}", interval);
        Some(runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if let Err(err) = pool.refresh().await {
                    warn!("Proxy pool refresh failed: {}", err);
                }
            }
        }))
    }

    /// Sends one check request through a proxy and records the result.
    ///
    /// A passing check slower than `slow_threshold_ms` still counts as a
    /// success; its latency lowers the proxy's score.
    pub async fn test_proxy(
        &self,
        id: ProxyId,
        checker: &dyn ProxyChecker,
        timeout: Duration,
    ) -> Result<ProxyCheck> {
        let record = self.get(id).await.ok_or_else(|| unknown_proxy(id))?;
        let started = Instant::now();
        let deadline = started + timeout;
        let result = match tokio::time::timeout_at(deadline, checker.check(&record, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let (outcome, error) = match &result {
            Ok(()) => (AttemptOutcome::Success, None),
            Err(err) => (AttemptOutcome::from(err.kind()), Some(err.to_string())),
        };
        let slow = outcome.is_success() && latency_ms > self.health.slow_threshold_ms;
        let health = self.record_outcome(id, outcome, latency_ms).await?;

        match &error {
            None if slow => warn!("Proxy {} is slow ({}ms)", record.display_name(), latency_ms),
            None => info!("Proxy {} passed its check ({}ms)", record.display_name(), latency_ms),
            Some(error) => warn!("Proxy {} failed its check: {}", record.display_name(), error),
        }
        Ok(ProxyCheck {
            id,
            outcome,
            latency_ms,
            slow,
            error,
            health,
        })
    }

    /// Checks every proxy that has never been tested.
    pub async fn test_untested(&self, checker: &dyn ProxyChecker, timeout: Duration) -> Vec<ProxyCheck> {
        self.test_matching(checker, timeout, |status| status == ProxyStatus::Untested)
            .await
    }

    /// Re-checks every proxy currently in rotation.
    pub async fn test_active(&self, checker: &dyn ProxyChecker, timeout: Duration) -> Vec<ProxyCheck> {
        self.test_matching(checker, timeout, |status| {
            matches!(status, ProxyStatus::Healthy | ProxyStatus::Degraded)
        })
        .await
    }

    async fn test_matching(
        &self,
        checker: &dyn ProxyChecker,
        timeout: Duration,
        wanted: impl Fn(ProxyStatus) -> bool,
    ) -> Vec<ProxyCheck> {
        let ids: Vec<ProxyId> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|s| wanted(s.status))
            .map(|s| s.id)
            .collect();
        info!("Checking {} proxies", ids.len());

        let checks = join_all(ids.iter().map(|id| self.test_proxy(*id, checker, timeout))).await;
        checks
            .into_iter()
            .filter_map(|check| match check {
                Ok(check) => Some(check),
                Err(err) => {
                    // removed while the check was in flight
                    debug!("Skipping proxy check: {}", err);
                    None
                }
            })
            .collect()
    }

    /// Returns the best eligible proxy.
    ///
    /// When `preference` is set and an eligible proxy speaks that protocol,
    /// only such proxies are considered.
    pub async fn select_proxy(&self, preference: Option<ProxyProtocol>) -> Result<ProxyRecord> {
        self.select_at(preference, &[], Utc::now()).await
    }

    /// Like [`ProxyPool::select_proxy`], but passes over the proxies in
    /// `avoid` unless nothing else is eligible.
    pub async fn select_proxy_avoiding(
        &self,
        preference: Option<ProxyProtocol>,
        avoid: &[ProxyId],
    ) -> Result<ProxyRecord> {
        self.select_at(preference, avoid, Utc::now()).await
    }

    async fn select_at(
        &self,
        preference: Option<ProxyProtocol>,
        avoid: &[ProxyId],
        now: DateTime<Utc>,
    ) -> Result<ProxyRecord> {
        let entries = self.entries().await;

        let mut candidates = Vec::new();
        for (position, entry) in entries.iter().enumerate() {
            let mut record = entry.record.lock().await;
            expire_ban(record.health_mut(), now);
            if !record.health().status.is_eligible() {
                continue;
            }
            candidates.push(Candidate {
                position,
                id: record.id,
                protocol: record.protocol(),
                score: score(record.health(), &self.health),
                last_used_at: record.health().last_used_at,
            });
        }

        if let Some(protocol) = preference {
            if candidates.iter().any(|c| c.protocol == protocol) {
                candidates.retain(|c| c.protocol == protocol);
            }
        }
        if candidates.iter().any(|c| !avoid.contains(&c.id)) {
            candidates.retain(|c| !avoid.contains(&c.id));
        }

        let best = candidates
            .into_iter()
            .reduce(|best, next| if next.beats(&best) { next } else { best })
            .ok_or(PipelineError::NoProxyAvailable)?;

        let entry = &entries[best.position];
        let mut record = entry.record.lock().await;
        record.health_mut().last_used_at = Some(now);
        debug!(
            "Selected proxy {} (score {:.3})",
            record.display_name(),
            best.score
        );
        Ok(record.clone())
    }

    /// Records the outcome of one attempt made through a proxy.
    ///
    /// This is the only place success/failure counts, latency and status
    /// change.
    pub async fn record_outcome(
        &self,
        id: ProxyId,
        outcome: AttemptOutcome,
        latency_ms: u64,
    ) -> Result<ProxyHealthSnapshot> {
        self.record_outcome_at(id, outcome, latency_ms, Utc::now()).await
    }

    async fn record_outcome_at(
        &self,
        id: ProxyId,
        outcome: AttemptOutcome,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<ProxyHealthSnapshot> {
        let entry = self.entry(id).await.ok_or_else(|| unknown_proxy(id))?;
        let mut record = entry.record.lock().await;
        let before = record.health().status;
        apply_outcome(record.health_mut(), outcome, latency_ms, now, &self.health);
        let after = record.health().status;

        if before != after {
            match after {
                ProxyStatus::Degraded => warn!("Proxy {} degraded", record.display_name()),
                ProxyStatus::BannedTemp => warn!(
                    "Proxy {} banned until {:?}",
                    record.display_name(),
                    record.health().banned_until
                ),
                _ => info!("Proxy {} is now {:?}", record.display_name(), after),
            }
        }
        Ok(record.snapshot())
    }

    /// Bans a proxy until `until`, regardless of its score.
    pub async fn mark_banned(&self, id: ProxyId, until: DateTime<Utc>) -> Result<()> {
        let entry = self.entry(id).await.ok_or_else(|| unknown_proxy(id))?;
        let mut record = entry.record.lock().await;
        let health = record.health_mut();
        health.status = ProxyStatus::BannedTemp;
        health.banned_until = Some(until);
        warn!("Proxy {} manually banned until {}", record.display_name(), until);
        Ok(())
    }

    /// Returns the health of every proxy.
    pub async fn snapshot(&self) -> Vec<ProxyHealthSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.entries().await {
            snapshots.push(entry.record.lock().await.snapshot());
        }
        snapshots
    }

    /// Counts proxies per status.
    pub async fn stats(&self) -> HashMap<ProxyStatus, usize> {
        let mut stats = HashMap::new();
        for snapshot in self.snapshot().await {
            *stats.entry(snapshot.status).or_insert(0) += 1;
        }
        stats
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

struct Candidate {
    position: usize,
    id: ProxyId,
    protocol: ProxyProtocol,
    score: f64,
    last_used_at: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Higher score wins; equal scores go to the least recently used.
    fn beats(&self, other: &Candidate) -> bool {
        if (self.score - other.score).abs() > SCORE_EPSILON {
            return self.score > other.score;
        }
        match (self.last_used_at, other.last_used_at) {
            (None, Some(_)) => true,
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

fn replace_keeping_health(current: &mut ProxyRecord, record: ProxyRecord) {
    let health = current.health().clone();
    *current = record;
    *current.health_mut() = health;
}

fn unknown_proxy(id: ProxyId) -> PipelineError {
    PipelineError::InvalidProxy(format!("unknown proxy {}", id))
}

/// Health score in `[0, success_weight + latency_weight]`.
///
/// The success rate is Laplace-smoothed, so an unused proxy rates 0.5 and
/// a handful of samples cannot push it to either extreme.
pub(crate) fn score(health: &ProxyHealth, config: &HealthConfig) -> f64 {
    let rate = (health.recent_successes + 1.0)
        / (health.recent_successes + health.recent_failures + 2.0);
    let latency = match health.avg_response_time_ms {
        Some(ms) => {
            let reference = config.latency_reference_ms.max(1) as f64;
            reference / (reference + ms as f64)
        }
        None => 0.5,
    };
    config.success_weight * rate + config.latency_weight * latency
}

fn expire_ban(health: &mut ProxyHealth, now: DateTime<Utc>) {
    if health.status != ProxyStatus::BannedTemp {
        return;
    }
    if health.banned_until.is_some_and(|until| until <= now) {
        health.status = ProxyStatus::Untested;
        health.banned_until = None;
        health.consecutive_failures = 0;
        health.consecutive_successes = 0;
    }
}

fn apply_outcome(
    health: &mut ProxyHealth,
    outcome: AttemptOutcome,
    latency_ms: u64,
    now: DateTime<Utc>,
    config: &HealthConfig,
) {
    expire_ban(health, now);
    health.last_used_at = Some(now);
    health.last_tested_at = Some(now);

    if !outcome.affects_health() {
        return;
    }

    health.recent_successes *= config.decay;
    health.recent_failures *= config.decay;

    if outcome == AttemptOutcome::Success {
        health.success_count += 1;
        health.recent_successes += 1.0;
        health.consecutive_successes += 1;
        health.consecutive_failures = 0;
        health.avg_response_time_ms = Some(match health.avg_response_time_ms {
            None => latency_ms,
            Some(avg) => {
                let alpha = config.latency_smoothing.clamp(0.0, 1.0);
                (alpha * latency_ms as f64 + (1.0 - alpha) * avg as f64).round() as u64
            }
        });
        health.status = match health.status {
            ProxyStatus::Untested => ProxyStatus::Healthy,
            ProxyStatus::Degraded if health.consecutive_successes >= config.recovery_successes => {
                ProxyStatus::Healthy
            }
            status => status,
        };
    } else {
        health.failure_count += 1;
        health.recent_failures += 1.0;
        health.consecutive_failures += 1;
        health.consecutive_successes = 0;
        health.status = match health.status {
            ProxyStatus::Untested => ProxyStatus::Degraded,
            ProxyStatus::Healthy if health.consecutive_failures >= config.degrade_after_failures => {
                ProxyStatus::Degraded
            }
            ProxyStatus::Degraded if health.consecutive_failures >= config.ban_after_failures => {
                let until = now
                    .checked_add_signed(config.ban_duration())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                health.banned_until = Some(until);
                ProxyStatus::BannedTemp
            }
            status => status,
        };
    }
}
