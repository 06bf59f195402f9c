//! Per-provider circuit breaker: CLOSED / OPEN / HALF_OPEN.
//!
//! Failures (as defined by the error classifier) within a sliding window
//! trip the breaker; OPEN providers are skipped by the selector; after
//! `open_duration` exactly one probe is admitted, and enough probe
//! successes close the circuit again.
//!
//! Transitions are strictly ordered per provider: every mutation happens
//! under the state-map write lock, then the snapshot is written through to
//! the durable store. The local entry carries a TTL so a snapshot written
//! by another coordinator is eventually picked up.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::providers::BreakerConfig;
use crate::store::{BreakerRow, SharedStore};

/// Breaker circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Outcome of asking the breaker whether a provider may take a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// CLOSED: dispatch freely
    Allow,
    /// HALF_OPEN and this caller holds the single probe slot
    Probe,
    /// OPEN, or HALF_OPEN with the probe already in flight
    Skip,
}

/// Health snapshot for the admin surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerHealth {
    pub provider_id: Uuid,
    pub state: String,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    /// Minutes until a probe is admitted, when OPEN
    pub recovery_minutes: Option<i64>,
}

#[derive(Debug)]
struct Entry {
    state: CircuitState,
    /// Failure timestamps inside the sliding window, newest last
    recent_failures: VecDeque<DateTime<Utc>>,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    loaded_at: DateTime<Utc>,
}

impl Entry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            success_count: 0,
            last_failure_at: None,
            open_until: None,
            probe_in_flight: false,
            loaded_at: now,
        }
    }

    fn from_row(row: &BreakerRow, now: DateTime<Utc>) -> Self {
        let mut recent_failures = VecDeque::new();
        if let Some(at) = row.last_failure_at {
            // the exact timestamps are not persisted; anchor the count at
            // the last failure so the window math keeps working
            for _ in 0..row.failure_count {
                recent_failures.push_back(at);
            }
        }
        Self {
            state: CircuitState::from_str(&row.state),
            recent_failures,
            success_count: row.success_count,
            last_failure_at: row.last_failure_at,
            open_until: row.open_until,
            probe_in_flight: false,
            loaded_at: now,
        }
    }

    fn to_row(&self, provider_id: Uuid, now: DateTime<Utc>) -> BreakerRow {
        BreakerRow {
            provider_id,
            state: self.state.as_str().to_string(),
            failure_count: self.recent_failures.len() as u32,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
            open_until: self.open_until,
            updated_at: now,
        }
    }

    fn prune_window(&mut self, cfg: &BreakerConfig, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(cfg.failure_window_secs as i64);
        while self.recent_failures.front().is_some_and(|t| *t < cutoff) {
            self.recent_failures.pop_front();
        }
    }
}

/// Shared breaker type.
pub type SharedBreaker = Arc<CircuitBreaker>;

pub struct CircuitBreaker {
    store: SharedStore,
    entries: RwLock<HashMap<Uuid, Entry>>,
    /// How long a locally cached entry is trusted before re-reading the
    /// durable snapshot
    cache_ttl: Duration,
}

impl CircuitBreaker {
    pub fn new(store: SharedStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            entries: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(30),
        })
    }

    /// Load the entry from the durable store when absent or stale. Entries
    /// with an active probe are never refreshed out from under the prober.
    async fn ensure_loaded(&self, provider_id: Uuid, now: DateTime<Utc>) {
        let needs_load = {
            let entries = self.entries.read().await;
            match entries.get(&provider_id) {
                None => true,
                Some(e) => {
                    !e.probe_in_flight
                        && (now - e.loaded_at).to_std().unwrap_or_default() > self.cache_ttl
                }
            }
        };
        if !needs_load {
            return;
        }
        let row = match self.store.load_breaker(provider_id).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(provider_id = %provider_id, error = %e, "Failed to load breaker snapshot");
                None
            }
        };
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(provider_id)
            .or_insert_with(|| Entry::fresh(now));
        if entry.probe_in_flight {
            return;
        }
        if let Some(row) = row {
            *entry = Entry::from_row(&row, now);
        } else {
            entry.loaded_at = now;
        }
    }

    async fn persist(&self, provider_id: Uuid, row: BreakerRow) {
        if let Err(e) = self.store.save_breaker(&row).await {
            tracing::warn!(provider_id = %provider_id, error = %e, "Failed to persist breaker snapshot");
        }
    }

    /// Read-only admission check used while filtering candidates; claims
    /// nothing. A `true` here can still race to `Skip` at claim time.
    pub async fn would_admit(&self, provider_id: Uuid, now: DateTime<Utc>) -> bool {
        self.ensure_loaded(provider_id, now).await;
        let entries = self.entries.read().await;
        match entries.get(&provider_id) {
            None => true,
            Some(e) => match e.state {
                CircuitState::Closed => true,
                CircuitState::Open => e.open_until.is_some_and(|until| now >= until),
                CircuitState::HalfOpen => !e.probe_in_flight,
            },
        }
    }

    /// Ask whether `provider_id` may take a request right now.
    pub async fn admit(&self, provider_id: Uuid, now: DateTime<Utc>) -> Admission {
        self.ensure_loaded(provider_id, now).await;
        let (admission, row) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(provider_id)
                .or_insert_with(|| Entry::fresh(now));
            match entry.state {
                CircuitState::Closed => (Admission::Allow, None),
                CircuitState::Open => {
                    if entry.open_until.is_some_and(|until| now >= until) {
                        entry.state = CircuitState::HalfOpen;
                        entry.success_count = 0;
                        entry.probe_in_flight = true;
                        tracing::info!(provider_id = %provider_id, "Breaker OPEN -> HALF_OPEN, admitting probe");
                        (Admission::Probe, Some(entry.to_row(provider_id, now)))
                    } else {
                        (Admission::Skip, None)
                    }
                }
                CircuitState::HalfOpen => {
                    if entry.probe_in_flight {
                        (Admission::Skip, None)
                    } else {
                        entry.probe_in_flight = true;
                        (Admission::Probe, None)
                    }
                }
            }
        };
        if let Some(row) = row {
            self.persist(provider_id, row).await;
        }
        admission
    }

    /// Record a successful upstream call.
    pub async fn on_success(&self, provider_id: Uuid, cfg: &BreakerConfig, now: DateTime<Utc>) {
        let row = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(provider_id)
                .or_insert_with(|| Entry::fresh(now));
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.probe_in_flight = false;
                    entry.success_count = entry.success_count.saturating_add(1);
                    if entry.success_count >= cfg.half_open_success_threshold {
                        entry.state = CircuitState::Closed;
                        entry.recent_failures.clear();
                        entry.success_count = 0;
                        entry.open_until = None;
                        tracing::info!(provider_id = %provider_id, "Breaker HALF_OPEN -> CLOSED");
                    }
                    Some(entry.to_row(provider_id, now))
                }
                CircuitState::Closed => {
                    if entry.recent_failures.is_empty() {
                        None
                    } else {
                        entry.recent_failures.clear();
                        Some(entry.to_row(provider_id, now))
                    }
                }
                // a success landing while OPEN is a stale in-flight request
                CircuitState::Open => None,
            }
        };
        if let Some(row) = row {
            self.persist(provider_id, row).await;
        }
    }

    /// Record a breaker-relevant failure.
    ///
    /// When the transition lands in OPEN, `retry_after` (from upstream rate
    /// limit headers) extends the open duration if it is longer.
    pub async fn on_failure(
        &self,
        provider_id: Uuid,
        cfg: &BreakerConfig,
        now: DateTime<Utc>,
        retry_after: Option<Duration>,
    ) {
        let open_for = Duration::from_secs(cfg.open_duration_secs)
            .max(retry_after.unwrap_or(Duration::ZERO));
        let row = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(provider_id)
                .or_insert_with(|| Entry::fresh(now));
            entry.last_failure_at = Some(now);
            match entry.state {
                CircuitState::HalfOpen => {
                    entry.probe_in_flight = false;
                    entry.state = CircuitState::Open;
                    entry.success_count = 0;
                    entry.open_until =
                        Some(now + chrono::Duration::from_std(open_for).expect("duration fits"));
                    tracing::warn!(provider_id = %provider_id, "Breaker HALF_OPEN -> OPEN (probe failed)");
                }
                CircuitState::Closed => {
                    entry.recent_failures.push_back(now);
                    entry.prune_window(cfg, now);
                    if entry.recent_failures.len() as u32 >= cfg.failure_threshold {
                        entry.state = CircuitState::Open;
                        entry.open_until = Some(
                            now + chrono::Duration::from_std(open_for).expect("duration fits"),
                        );
                        tracing::warn!(
                            provider_id = %provider_id,
                            failures = entry.recent_failures.len(),
                            open_secs = open_for.as_secs(),
                            "Breaker CLOSED -> OPEN"
                        );
                    }
                }
                CircuitState::Open => {}
            }
            entry.to_row(provider_id, now)
        };
        self.persist(provider_id, row).await;
    }

    /// Release a probe slot without recording an outcome (client abort).
    pub async fn release_probe(&self, provider_id: Uuid) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&provider_id) {
            entry.probe_in_flight = false;
        }
    }

    /// Force a provider back to CLOSED (admin action).
    pub async fn reset(&self, provider_id: Uuid, now: DateTime<Utc>) {
        let row = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry(provider_id)
                .or_insert_with(|| Entry::fresh(now));
            *entry = Entry::fresh(now);
            entry.to_row(provider_id, now)
        };
        tracing::info!(provider_id = %provider_id, "Breaker manually reset to CLOSED");
        self.persist(provider_id, row).await;
    }

    /// Current circuit state (selection filter).
    pub async fn state_of(&self, provider_id: Uuid, now: DateTime<Utc>) -> CircuitState {
        self.ensure_loaded(provider_id, now).await;
        let entries = self.entries.read().await;
        entries
            .get(&provider_id)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Health snapshot for a set of providers.
    pub async fn health_snapshot(
        &self,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Vec<BreakerHealth> {
        for id in ids {
            self.ensure_loaded(*id, now).await;
        }
        let entries = self.entries.read().await;
        ids.iter()
            .map(|id| match entries.get(id) {
                Some(e) => BreakerHealth {
                    provider_id: *id,
                    state: e.state.as_str().to_string(),
                    failure_count: e.recent_failures.len() as u32,
                    last_failure_at: e.last_failure_at,
                    open_until: e.open_until,
                    recovery_minutes: match (e.state, e.open_until) {
                        (CircuitState::Open, Some(until)) if until > now => {
                            Some(((until - now).num_seconds() + 59) / 60)
                        }
                        _ => None,
                    },
                },
                None => BreakerHealth {
                    provider_id: *id,
                    state: CircuitState::Closed.as_str().to_string(),
                    failure_count: 0,
                    last_failure_at: None,
                    open_until: None,
                    recovery_minutes: None,
                },
            })
            .collect()
    }
}
