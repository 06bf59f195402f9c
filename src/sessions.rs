//! Session tracker: active sessions per provider and per key, with the
//! provider pin used for session affinity.
//!
//! Backed by an expiry-scored map keyed by session id. Opening is
//! idempotent (refreshes the TTL and last-seen), closing never drops a
//! count below zero, and expired entries are lazily collected on the next
//! count or lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Default session TTL: 30 minutes.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
struct SessionEntry {
    provider_id: Uuid,
    key_id: Uuid,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Shared tracker type.
pub type SharedSessions = Arc<SessionTracker>;

#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open (or refresh) a session pinned to `provider_id`.
    pub async fn open_session(
        &self,
        provider_id: Uuid,
        key_id: Uuid,
        session_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let expires_at = now + chrono::Duration::from_std(ttl).expect("ttl fits");
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .and_modify(|e| {
                e.provider_id = provider_id;
                e.last_seen = now;
                e.expires_at = expires_at;
            })
            .or_insert(SessionEntry {
                provider_id,
                key_id,
                first_seen: now,
                last_seen: now,
                expires_at,
            });
    }

    /// Close a session. A second close of the same id is a no-op, so counts
    /// never go negative.
    pub async fn close_session(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    /// Number of live sessions currently pinned to a provider.
    pub async fn count_by_provider(&self, provider_id: Uuid, now: DateTime<Utc>) -> usize {
        self.collect_expired(now).await;
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|e| e.provider_id == provider_id)
            .count()
    }

    /// Number of live sessions opened under a key.
    pub async fn count_by_key(&self, key_id: Uuid, now: DateTime<Utc>) -> usize {
        self.collect_expired(now).await;
        let sessions = self.sessions.read().await;
        sessions.values().filter(|e| e.key_id == key_id).count()
    }

    /// Provider a session is pinned to, if the pin is still live.
    pub async fn pinned_provider(&self, session_id: &str, now: DateTime<Utc>) -> Option<Uuid> {
        self.collect_expired(now).await;
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|e| e.provider_id)
    }

    /// First/last seen for diagnostics.
    pub async fn session_span(
        &self,
        session_id: &str,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|e| (e.first_seen, e.last_seen))
    }

    async fn collect_expired(&self, now: DateTime<Utc>) {
        let has_expired = {
            let sessions = self.sessions.read().await;
            sessions.values().any(|e| e.expires_at <= now)
        };
        if !has_expired {
            return;
        }
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, e| e.expires_at > now);
    }
}
