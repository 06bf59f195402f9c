//! Shared usage counters.
//!
//! Process-wide fast store the limiter reads and the recorder commits into.
//! Keys follow the persisted layout: `cost:{kind}:{id}:{window}:{bucket}`
//! for window-aligned totals, one rolling entry list per subject for the
//! trailing-window sums, and `rpm:user:{id}:{minute}` for request counts.
//!
//! Fixed-bucket totals are add-only; monotonicity per `(subject, window,
//! bucket)` is an invariant the tests pin down.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Who a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    Provider,
    Key,
    User,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Key => "key",
            Self::User => "user",
        }
    }
}

/// A counter scope: kind plus record id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: Uuid,
}

impl Subject {
    pub fn provider(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Provider,
            id,
        }
    }

    pub fn key(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Key,
            id,
        }
    }

    pub fn user(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::User,
            id,
        }
    }

    /// `cost:{kind}:{id}` prefix shared by this subject's cost keys.
    pub fn cost_prefix(&self) -> String {
        format!("cost:{}:{}", self.kind.as_str(), self.id)
    }
}

/// One read in a batched counter lookup.
#[derive(Debug, Clone)]
pub enum CostQuery {
    /// Window-aligned total under `cost:{prefix}:{window}:{bucket}`
    Fixed(String),
    /// Trailing-window sum over the subject's rolling entries
    Rolling { span: Duration },
}

/// Rolling entries older than this are collected; covers the longest
/// trailing window we ever sum (rolling daily).
const ROLLING_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Minute buckets older than this are collected.
const RPM_RETENTION_MINUTES: i64 = 2;

#[derive(Default)]
struct Inner {
    /// `cost:{kind}:{id}:{window}:{bucket}` -> nanodollars, add-only
    fixed: HashMap<String, u64>,
    /// `cost:{kind}:{id}` -> (timestamp, nanodollars), newest last
    rolling: HashMap<String, VecDeque<(DateTime<Utc>, u64)>>,
    /// `rpm:user:{id}:{minute}` -> request count
    rpm: HashMap<String, u32>,
}

/// Shared counter store type.
pub type SharedCounters = Arc<CounterStore>;

#[derive(Default)]
pub struct CounterStore {
    inner: RwLock<Inner>,
}

fn rpm_key(user_id: Uuid, minute: i64) -> String {
    format!("rpm:user:{}:{}", user_id, minute)
}

impl CounterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically add `nanos` to every window of a subject: each fixed
    /// bucket key plus one rolling entry.
    pub async fn commit_cost(
        &self,
        subject: &Subject,
        fixed_keys: &[String],
        nanos: u64,
        now: DateTime<Utc>,
    ) {
        if nanos == 0 {
            return;
        }
        let mut inner = self.inner.write().await;
        for key in fixed_keys {
            *inner.fixed.entry(key.clone()).or_insert(0) += nanos;
        }
        let entries = inner.rolling.entry(subject.cost_prefix()).or_default();
        entries.push_back((now, nanos));
        let cutoff = now - chrono::Duration::from_std(ROLLING_RETENTION).expect("retention fits");
        while entries.front().is_some_and(|(t, _)| *t < cutoff) {
            entries.pop_front();
        }
    }

    /// Read a batch of cost counters for one subject under a single lock.
    pub async fn read_batch(
        &self,
        subject: &Subject,
        queries: &[CostQuery],
        now: DateTime<Utc>,
    ) -> Vec<u64> {
        let inner = self.inner.read().await;
        let prefix = subject.cost_prefix();
        queries
            .iter()
            .map(|q| match q {
                CostQuery::Fixed(key) => inner.fixed.get(key).copied().unwrap_or(0),
                CostQuery::Rolling { span } => {
                    let cutoff =
                        now - chrono::Duration::from_std(*span).expect("span fits");
                    inner
                        .rolling
                        .get(&prefix)
                        .map(|entries| {
                            entries
                                .iter()
                                .filter(|(t, _)| *t >= cutoff)
                                .map(|(_, n)| n)
                                .sum()
                        })
                        .unwrap_or(0)
                }
            })
            .collect()
    }

    /// Record one request for the user's RPM window.
    pub async fn incr_rpm(&self, user_id: Uuid, now: DateTime<Utc>) {
        let minute = now.timestamp() / 60;
        let mut inner = self.inner.write().await;
        *inner.rpm.entry(rpm_key(user_id, minute)).or_insert(0) += 1;
        // lazy collection of stale minute buckets for this user
        let stale: Vec<String> = inner
            .rpm
            .keys()
            .filter(|k| {
                k.starts_with(&format!("rpm:user:{}:", user_id))
                    && k.rsplit(':')
                        .next()
                        .and_then(|m| m.parse::<i64>().ok())
                        .is_some_and(|m| m < minute - RPM_RETENTION_MINUTES)
            })
            .cloned()
            .collect();
        for key in stale {
            inner.rpm.remove(&key);
        }
    }

    /// Sliding 60 s request count, approximated from minute buckets: the
    /// current bucket plus the previous one weighted by its remaining
    /// overlap with the trailing minute.
    pub async fn rpm_sliding(&self, user_id: Uuid, now: DateTime<Utc>) -> u32 {
        let minute = now.timestamp() / 60;
        let elapsed_in_minute = (now.timestamp() % 60) as f64 / 60.0;
        let inner = self.inner.read().await;
        let current = inner
            .rpm
            .get(&rpm_key(user_id, minute))
            .copied()
            .unwrap_or(0);
        let previous = inner
            .rpm
            .get(&rpm_key(user_id, minute - 1))
            .copied()
            .unwrap_or(0);
        current + (previous as f64 * (1.0 - elapsed_in_minute)).floor() as u32
    }

    /// Current value of one fixed bucket (admin snapshots, tests).
    pub async fn fixed_value(&self, key: &str) -> u64 {
        self.inner.read().await.fixed.get(key).copied().unwrap_or(0)
    }
}
