//! SQLite-backed row stores: providers, keys, users, model prices, usage
//! logs, and breaker snapshots.
//!
//! Structured records are stored as JSON blobs with the columns the hot path
//! actually filters on (hash, enabled flags) extracted alongside; usage logs
//! and prices get real columns since the admin surface queries them.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chain::ChainItem;
use crate::pricing::ModelPrice;
use crate::providers::Provider;
use crate::tenants::{ApiKey, User};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS providers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    record TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys(key_hash);
CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS model_prices (
    model TEXT PRIMARY KEY NOT NULL,
    input_usd_per_mtok REAL NOT NULL,
    output_usd_per_mtok REAL NOT NULL,
    cache_write_5m_usd_per_mtok REAL NOT NULL DEFAULT 0,
    cache_write_1h_usd_per_mtok REAL NOT NULL DEFAULT 0,
    cache_read_usd_per_mtok REAL NOT NULL DEFAULT 0,
    supports_1m_context INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_logs (
    id TEXT PRIMARY KEY NOT NULL,
    key_id TEXT,
    user_id TEXT,
    provider_id TEXT,
    model TEXT NOT NULL,
    original_model TEXT,
    endpoint TEXT NOT NULL,
    status INTEGER,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_5m_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_1h_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    cache_ttl_applied TEXT,
    context_1m_applied INTEGER NOT NULL DEFAULT 0,
    cost_nanos INTEGER NOT NULL DEFAULT 0,
    billed INTEGER NOT NULL DEFAULT 1,
    duration_ms INTEGER,
    ttfb_ms INTEGER,
    provider_chain TEXT NOT NULL DEFAULT '[]',
    blocked_by TEXT,
    blocked_reason TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_logs_created ON usage_logs(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_usage_logs_key ON usage_logs(key_id, created_at);
CREATE INDEX IF NOT EXISTS idx_usage_logs_provider ON usage_logs(provider_id, created_at);

CREATE TABLE IF NOT EXISTS breaker_states (
    provider_id TEXT PRIMARY KEY NOT NULL,
    state TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    last_failure_at TEXT,
    open_until TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// A usage log row, one per processed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogRow {
    pub id: Uuid,
    pub key_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    /// Model actually dispatched (after any redirect)
    pub model: String,
    /// Client-requested model when a redirect applied
    pub original_model: Option<String>,
    pub endpoint: String,
    pub status: Option<u16>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_5m_tokens: u64,
    pub cache_creation_1h_tokens: u64,
    pub cache_read_tokens: u64,
    /// "5m" or "1h" when a cache write happened
    pub cache_ttl_applied: Option<String>,
    pub context_1m_applied: bool,
    pub cost_nanos: u64,
    /// False for count_tokens and other non-billing rows
    pub billed: bool,
    pub duration_ms: Option<u64>,
    pub ttfb_ms: Option<u64>,
    pub provider_chain: Vec<ChainItem>,
    pub blocked_by: Option<String>,
    pub blocked_reason: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable breaker snapshot row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRow {
    pub provider_id: Uuid,
    pub state: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Shared store handle.
pub type SharedStore = Arc<Store>;

/// The durable store. Short transactions over one pooled connection.
pub struct Store {
    conn: Mutex<Connection>,
}

fn parse_uuid_or_nil(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|e| {
        tracing::warn!(raw_value = %raw, error = %e, "Corrupt UUID in database; substituting nil UUID");
        Uuid::nil()
    })
}

fn to_json_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Providers
    // ─────────────────────────────────────────────────────────────────────

    pub async fn list_providers(&self) -> Result<Vec<Provider>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM providers ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let record: String = row.get(0)?;
            serde_json::from_str::<Provider>(&record).map_err(to_json_err)
        })?;
        rows.collect()
    }

    pub async fn get_provider(&self, id: Uuid) -> Result<Option<Provider>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT record FROM providers WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let record: String = row.get(0)?;
                serde_json::from_str::<Provider>(&record).map_err(to_json_err)
            },
        )
        .optional()
    }

    pub async fn upsert_provider(&self, provider: &Provider) -> Result<(), rusqlite::Error> {
        let record = serde_json::to_string(provider).map_err(to_json_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO providers (id, name, enabled, record, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 enabled = excluded.enabled,
                 record = excluded.record,
                 updated_at = excluded.updated_at",
            params![
                provider.id.to_string(),
                provider.name,
                provider.enabled as i64,
                record,
                provider.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_provider(&self, id: Uuid) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM providers WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Reset a provider's `total` window anchor to `now`.
    pub async fn reset_provider_total_anchor(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let provider = match self.get_provider(id).await? {
            Some(p) => p,
            None => return Ok(false),
        };
        let mut provider = provider;
        provider.total_cost_reset_at = now;
        provider.updated_at = now;
        self.upsert_provider(&provider).await?;
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────
    // API keys
    // ─────────────────────────────────────────────────────────────────────

    pub async fn list_keys(&self) -> Result<Vec<ApiKey>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM api_keys ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            let record: String = row.get(0)?;
            serde_json::from_str::<ApiKey>(&record).map_err(to_json_err)
        })?;
        rows.collect()
    }

    pub async fn get_key(&self, id: Uuid) -> Result<Option<ApiKey>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT record FROM api_keys WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let record: String = row.get(0)?;
                serde_json::from_str::<ApiKey>(&record).map_err(to_json_err)
            },
        )
        .optional()
    }

    /// Look up an enabled key by the SHA-256 digest of its raw value.
    pub async fn find_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT record FROM api_keys WHERE key_hash = ?1 AND enabled = 1",
            params![hash],
            |row| {
                let record: String = row.get(0)?;
                serde_json::from_str::<ApiKey>(&record).map_err(to_json_err)
            },
        )
        .optional()
    }

    pub async fn upsert_key(&self, key: &ApiKey) -> Result<(), rusqlite::Error> {
        let record = serde_json::to_string(key).map_err(to_json_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO api_keys (id, user_id, key_hash, enabled, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 user_id = excluded.user_id,
                 key_hash = excluded.key_hash,
                 enabled = excluded.enabled,
                 record = excluded.record",
            params![
                key.id.to_string(),
                key.user_id.to_string(),
                key.key_hash,
                key.enabled as i64,
                record,
                key.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_key(&self, id: Uuid) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM api_keys WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    pub async fn list_users(&self) -> Result<Vec<User>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT record FROM users ORDER BY created_at")?;
        let rows = stmt.query_map([], |row| {
            let record: String = row.get(0)?;
            serde_json::from_str::<User>(&record).map_err(to_json_err)
        })?;
        rows.collect()
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT record FROM users WHERE id = ?1",
            params![id.to_string()],
            |row| {
                let record: String = row.get(0)?;
                serde_json::from_str::<User>(&record).map_err(to_json_err)
            },
        )
        .optional()
    }

    pub async fn upsert_user(&self, user: &User) -> Result<(), rusqlite::Error> {
        let record = serde_json::to_string(user).map_err(to_json_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (id, enabled, record, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 enabled = excluded.enabled,
                 record = excluded.record",
            params![
                user.id.to_string(),
                user.enabled as i64,
                record,
                user.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_user(&self, id: Uuid) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM users WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Model prices
    // ─────────────────────────────────────────────────────────────────────

    pub async fn get_price(&self, model: &str) -> Result<Option<ModelPrice>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT model, input_usd_per_mtok, output_usd_per_mtok,
                    cache_write_5m_usd_per_mtok, cache_write_1h_usd_per_mtok,
                    cache_read_usd_per_mtok, supports_1m_context, updated_at
             FROM model_prices WHERE model = ?1",
            params![model],
            Self::parse_price_row,
        )
        .optional()
    }

    pub async fn upsert_price(&self, price: &ModelPrice) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO model_prices (model, input_usd_per_mtok, output_usd_per_mtok,
                 cache_write_5m_usd_per_mtok, cache_write_1h_usd_per_mtok,
                 cache_read_usd_per_mtok, supports_1m_context, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(model) DO UPDATE SET
                 input_usd_per_mtok = excluded.input_usd_per_mtok,
                 output_usd_per_mtok = excluded.output_usd_per_mtok,
                 cache_write_5m_usd_per_mtok = excluded.cache_write_5m_usd_per_mtok,
                 cache_write_1h_usd_per_mtok = excluded.cache_write_1h_usd_per_mtok,
                 cache_read_usd_per_mtok = excluded.cache_read_usd_per_mtok,
                 supports_1m_context = excluded.supports_1m_context,
                 updated_at = excluded.updated_at",
            params![
                price.model,
                price.input_usd_per_mtok,
                price.output_usd_per_mtok,
                price.cache_write_5m_usd_per_mtok,
                price.cache_write_1h_usd_per_mtok,
                price.cache_read_usd_per_mtok,
                price.supports_1m_context as i64,
                price.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn parse_price_row(row: &rusqlite::Row<'_>) -> Result<ModelPrice, rusqlite::Error> {
        let updated_at_raw: String = row.get(7)?;
        Ok(ModelPrice {
            model: row.get(0)?,
            input_usd_per_mtok: row.get(1)?,
            output_usd_per_mtok: row.get(2)?,
            cache_write_5m_usd_per_mtok: row.get(3)?,
            cache_write_1h_usd_per_mtok: row.get(4)?,
            cache_read_usd_per_mtok: row.get(5)?,
            supports_1m_context: row.get::<_, i64>(6)? != 0,
            updated_at: parse_timestamp(&updated_at_raw).unwrap_or_else(Utc::now),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Usage logs
    // ─────────────────────────────────────────────────────────────────────

    pub async fn append_usage(&self, row: &UsageLogRow) -> Result<(), rusqlite::Error> {
        let chain = serde_json::to_string(&row.provider_chain).map_err(to_json_err)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO usage_logs (
                 id, key_id, user_id, provider_id, model, original_model, endpoint,
                 status, input_tokens, output_tokens, cache_creation_5m_tokens,
                 cache_creation_1h_tokens, cache_read_tokens, cache_ttl_applied,
                 context_1m_applied, cost_nanos, billed, duration_ms, ttfb_ms,
                 provider_chain, blocked_by, blocked_reason, error_message, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                       ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            params![
                row.id.to_string(),
                row.key_id.map(|v| v.to_string()),
                row.user_id.map(|v| v.to_string()),
                row.provider_id.map(|v| v.to_string()),
                row.model,
                row.original_model,
                row.endpoint,
                row.status.map(|s| s as i64),
                row.input_tokens as i64,
                row.output_tokens as i64,
                row.cache_creation_5m_tokens as i64,
                row.cache_creation_1h_tokens as i64,
                row.cache_read_tokens as i64,
                row.cache_ttl_applied,
                row.context_1m_applied as i64,
                row.cost_nanos as i64,
                row.billed as i64,
                row.duration_ms.map(|v| v as i64),
                row.ttfb_ms.map(|v| v as i64),
                chain,
                row.blocked_by,
                row.blocked_reason,
                row.error_message,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_usage(&self, id: Uuid) -> Result<Option<UsageLogRow>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, key_id, user_id, provider_id, model, original_model, endpoint,
                    status, input_tokens, output_tokens, cache_creation_5m_tokens,
                    cache_creation_1h_tokens, cache_read_tokens, cache_ttl_applied,
                    context_1m_applied, cost_nanos, billed, duration_ms, ttfb_ms,
                    provider_chain, blocked_by, blocked_reason, error_message, created_at
             FROM usage_logs WHERE id = ?1",
            params![id.to_string()],
            Self::parse_usage_row,
        )
        .optional()
    }

    fn parse_usage_row(row: &rusqlite::Row<'_>) -> Result<UsageLogRow, rusqlite::Error> {
        let id: String = row.get(0)?;
        let key_id: Option<String> = row.get(1)?;
        let user_id: Option<String> = row.get(2)?;
        let provider_id: Option<String> = row.get(3)?;
        let chain_raw: String = row.get(19)?;
        let created_at_raw: String = row.get(23)?;
        Ok(UsageLogRow {
            id: parse_uuid_or_nil(&id),
            key_id: key_id.as_deref().map(parse_uuid_or_nil),
            user_id: user_id.as_deref().map(parse_uuid_or_nil),
            provider_id: provider_id.as_deref().map(parse_uuid_or_nil),
            model: row.get(4)?,
            original_model: row.get(5)?,
            endpoint: row.get(6)?,
            status: row.get::<_, Option<i64>>(7)?.map(|v| v as u16),
            input_tokens: row.get::<_, i64>(8)? as u64,
            output_tokens: row.get::<_, i64>(9)? as u64,
            cache_creation_5m_tokens: row.get::<_, i64>(10)? as u64,
            cache_creation_1h_tokens: row.get::<_, i64>(11)? as u64,
            cache_read_tokens: row.get::<_, i64>(12)? as u64,
            cache_ttl_applied: row.get(13)?,
            context_1m_applied: row.get::<_, i64>(14)? != 0,
            cost_nanos: row.get::<_, i64>(15)? as u64,
            billed: row.get::<_, i64>(16)? != 0,
            duration_ms: row.get::<_, Option<i64>>(17)?.map(|v| v as u64),
            ttfb_ms: row.get::<_, Option<i64>>(18)?.map(|v| v as u64),
            provider_chain: serde_json::from_str(&chain_raw).map_err(to_json_err)?,
            blocked_by: row.get(20)?,
            blocked_reason: row.get(21)?,
            error_message: row.get(22)?,
            created_at: parse_timestamp(&created_at_raw).unwrap_or_else(Utc::now),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Breaker snapshots
    // ─────────────────────────────────────────────────────────────────────

    pub async fn load_breaker(&self, id: Uuid) -> Result<Option<BreakerRow>, rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT provider_id, state, failure_count, success_count,
                    last_failure_at, open_until, updated_at
             FROM breaker_states WHERE provider_id = ?1",
            params![id.to_string()],
            Self::parse_breaker_row,
        )
        .optional()
    }

    pub async fn save_breaker(&self, row: &BreakerRow) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO breaker_states (provider_id, state, failure_count, success_count,
                 last_failure_at, open_until, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(provider_id) DO UPDATE SET
                 state = excluded.state,
                 failure_count = excluded.failure_count,
                 success_count = excluded.success_count,
                 last_failure_at = excluded.last_failure_at,
                 open_until = excluded.open_until,
                 updated_at = excluded.updated_at",
            params![
                row.provider_id.to_string(),
                row.state,
                row.failure_count as i64,
                row.success_count as i64,
                row.last_failure_at.map(|t| t.to_rfc3339()),
                row.open_until.map(|t| t.to_rfc3339()),
                row.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_breaker(&self, id: Uuid) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM breaker_states WHERE provider_id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    /// All usage row ids, oldest first (test support).
    #[cfg(test)]
    pub async fn usage_ids_for_tests(&self) -> Vec<Uuid> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM usage_logs ORDER BY created_at")
            .expect("prepare");
        let ids = stmt
            .query_map([], |row| {
                let raw: String = row.get(0)?;
                Ok(parse_uuid_or_nil(&raw))
            })
            .expect("query");
        ids.filter_map(|r| r.ok()).collect()
    }

    fn parse_breaker_row(row: &rusqlite::Row<'_>) -> Result<BreakerRow, rusqlite::Error> {
        let provider_id: String = row.get(0)?;
        let last_failure_at: Option<String> = row.get(4)?;
        let open_until: Option<String> = row.get(5)?;
        let updated_at_raw: String = row.get(6)?;
        Ok(BreakerRow {
            provider_id: parse_uuid_or_nil(&provider_id),
            state: row.get(1)?,
            failure_count: row.get::<_, i64>(2)? as u32,
            success_count: row.get::<_, i64>(3)? as u32,
            last_failure_at: last_failure_at.as_deref().and_then(parse_timestamp),
            open_until: open_until.as_deref().and_then(parse_timestamp),
            updated_at: parse_timestamp(&updated_at_raw).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{test_provider, ProviderType};
    use crate::tenants::{test_key, test_user};

    #[tokio::test]
    async fn provider_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let p = test_provider("alpha", ProviderType::Claude);
        store.upsert_provider(&p).await.expect("upsert");

        let listed = store.list_providers().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, p.id);
        assert_eq!(listed[0].provider_type, ProviderType::Claude);

        assert!(store.delete_provider(p.id).await.expect("delete"));
        assert!(store.get_provider(p.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn key_lookup_by_hash_respects_enabled() {
        let store = Store::open_in_memory().expect("open");
        let user = test_user();
        store.upsert_user(&user).await.expect("user");
        let mut key = test_key(user.id);
        store.upsert_key(&key).await.expect("key");

        let found = store
            .find_key_by_hash(&key.key_hash)
            .await
            .expect("lookup");
        assert!(found.is_some());

        key.enabled = false;
        store.upsert_key(&key).await.expect("disable");
        let found = store
            .find_key_by_hash(&key.key_hash)
            .await
            .expect("lookup");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn usage_row_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let row = UsageLogRow {
            id: Uuid::new_v4(),
            key_id: Some(Uuid::new_v4()),
            user_id: Some(Uuid::new_v4()),
            provider_id: Some(Uuid::new_v4()),
            model: "claude-sonnet-4".to_string(),
            original_model: Some("claude-3-opus".to_string()),
            endpoint: "/v1/messages".to_string(),
            status: Some(200),
            input_tokens: 1000,
            output_tokens: 200,
            cache_creation_5m_tokens: 0,
            cache_creation_1h_tokens: 0,
            cache_read_tokens: 50,
            cache_ttl_applied: None,
            context_1m_applied: false,
            cost_nanos: 42,
            billed: true,
            duration_ms: Some(1234),
            ttfb_ms: Some(210),
            provider_chain: Vec::new(),
            blocked_by: None,
            blocked_reason: None,
            error_message: None,
            created_at: Utc::now(),
        };
        store.append_usage(&row).await.expect("append");
        let got = store.get_usage(row.id).await.expect("get").expect("row");
        assert_eq!(got.model, "claude-sonnet-4");
        assert_eq!(got.status, Some(200));
        assert_eq!(got.cost_nanos, 42);
        assert_eq!(got.original_model.as_deref(), Some("claude-3-opus"));
    }

    #[tokio::test]
    async fn usage_append_is_idempotent_by_id() {
        let store = Store::open_in_memory().expect("open");
        let mut row = UsageLogRow {
            id: Uuid::new_v4(),
            key_id: None,
            user_id: None,
            provider_id: None,
            model: "m".to_string(),
            original_model: None,
            endpoint: "/v1/messages".to_string(),
            status: Some(200),
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_5m_tokens: 0,
            cache_creation_1h_tokens: 0,
            cache_read_tokens: 0,
            cache_ttl_applied: None,
            context_1m_applied: false,
            cost_nanos: 1,
            billed: true,
            duration_ms: None,
            ttfb_ms: None,
            provider_chain: Vec::new(),
            blocked_by: None,
            blocked_reason: None,
            error_message: None,
            created_at: Utc::now(),
        };
        store.append_usage(&row).await.expect("first");
        row.cost_nanos = 2;
        store.append_usage(&row).await.expect("retry");
        let got = store.get_usage(row.id).await.expect("get").expect("row");
        assert_eq!(got.cost_nanos, 2);
    }

    #[tokio::test]
    async fn breaker_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let row = BreakerRow {
            provider_id: Uuid::new_v4(),
            state: "open".to_string(),
            failure_count: 3,
            success_count: 0,
            last_failure_at: Some(Utc::now()),
            open_until: Some(Utc::now() + chrono::Duration::seconds(300)),
            updated_at: Utc::now(),
        };
        store.save_breaker(&row).await.expect("save");
        let got = store
            .load_breaker(row.provider_id)
            .await
            .expect("load")
            .expect("row");
        assert_eq!(got.state, "open");
        assert_eq!(got.failure_count, 3);
        assert!(store.delete_breaker(row.provider_id).await.expect("del"));
    }
}
