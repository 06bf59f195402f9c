//! Tenant records: API keys and the users that own them.
//!
//! Raw key values are never stored; only a SHA-256 digest plus a short
//! display prefix, so a leaked database does not expose usable keys.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// USD spend limits shared by keys and users. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendLimits {
    pub limit_5h_usd: Option<f64>,
    pub limit_daily_usd: Option<f64>,
    pub limit_weekly_usd: Option<f64>,
    pub limit_monthly_usd: Option<f64>,
    pub limit_total_usd: Option<f64>,
}

/// An API key issued to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Human-readable label (e.g. "CI", "staging")
    pub name: String,
    /// SHA-256 hex digest of the raw key
    pub key_hash: String,
    /// First characters of the raw key for display ("sk-relay-a1b2…")
    pub key_prefix: String,
    pub enabled: bool,
    #[serde(default)]
    pub limits: SpendLimits,
    pub limit_concurrent_sessions: Option<u32>,
    /// Provider groups this key may route to
    #[serde(default)]
    pub provider_groups: HashSet<String>,
    pub total_cost_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A user owning one or more keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub limits: SpendLimits,
    /// Requests per minute, sliding 60 s
    pub rpm_limit: Option<u32>,
    /// Provider groups; may contain the wildcard "all"
    #[serde(default)]
    pub provider_groups: HashSet<String>,
    pub total_cost_reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 hex digest of a raw key value.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a fresh raw key value with its display prefix.
pub fn generate_key() -> (String, String) {
    let raw = format!("sk-relay-{}", Uuid::new_v4().as_simple());
    let prefix = raw[..16].to_string();
    (raw, prefix)
}

#[cfg(test)]
pub(crate) fn test_key(user_id: Uuid) -> ApiKey {
    let (raw, prefix) = generate_key();
    ApiKey {
        id: Uuid::new_v4(),
        user_id,
        name: "test".to_string(),
        key_hash: hash_key(&raw),
        key_prefix: prefix,
        enabled: true,
        limits: SpendLimits::default(),
        limit_concurrent_sessions: None,
        provider_groups: std::iter::once(crate::providers::DEFAULT_GROUP.to_string()).collect(),
        total_cost_reset_at: Utc::now(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
pub(crate) fn test_user() -> User {
    User {
        id: Uuid::new_v4(),
        name: "test-user".to_string(),
        enabled: true,
        limits: SpendLimits::default(),
        rpm_limit: None,
        provider_groups: std::iter::once(crate::providers::GROUP_WILDCARD.to_string()).collect(),
        total_cost_reset_at: Utc::now(),
        created_at: Utc::now(),
    }
}
