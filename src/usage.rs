//! Usage recorder: cost attribution, counter commits, and the log row.
//!
//! Runs after every request, successful or not. Cost is computed from the
//! price table with the provider's multiplier, committed into the key,
//! user, and provider counters, then the log row is appended. The row
//! insert is idempotent by id, so a retried commit never double-writes.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::chain::ChainItem;
use crate::config::CacheTier;
use crate::counters::Subject;
use crate::limiter::SharedLimiter;
use crate::pricing::{compute_cost, UsageTokens};
use crate::providers::{CacheTierPreference, Provider};
use crate::redact::redact;
use crate::store::{SharedStore, UsageLogRow};
use crate::stream::MergedResponse;
use crate::tenants::{ApiKey, User};

/// Everything the recorder needs about one finished request.
pub struct RecordInput {
    pub request_id: Uuid,
    pub key: ApiKey,
    pub user: User,
    pub provider: Option<Provider>,
    /// Model dispatched upstream (after redirect)
    pub model: String,
    /// Client-requested model when a redirect applied
    pub original_model: Option<String>,
    pub endpoint: String,
    pub status: Option<u16>,
    pub merged: MergedResponse,
    pub chain: Vec<ChainItem>,
    pub duration_ms: Option<u64>,
    pub ttfb_ms: Option<u64>,
    pub blocked_by: Option<String>,
    pub blocked_reason: Option<String>,
    pub error_message: Option<String>,
    /// count_tokens rows are forced to zero cost and flagged non-billing
    pub count_tokens: bool,
}

/// Shared recorder type.
pub type SharedRecorder = Arc<UsageRecorder>;

pub struct UsageRecorder {
    store: SharedStore,
    limiter: SharedLimiter,
    cache_tier_default: CacheTier,
}

impl UsageRecorder {
    pub fn new(
        store: SharedStore,
        limiter: SharedLimiter,
        cache_tier_default: CacheTier,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            limiter,
            cache_tier_default,
        })
    }

    /// Resolve the provider's cache-tier preference against the process
    /// default.
    fn resolve_tier(&self, provider: Option<&Provider>) -> CacheTier {
        match provider.map(|p| p.cache_tier).unwrap_or_default() {
            CacheTierPreference::FiveMinute => CacheTier::FiveMinute,
            CacheTierPreference::OneHour => CacheTier::OneHour,
            CacheTierPreference::Inherit => self.cache_tier_default,
        }
    }

    /// Attribute cost and tokens, commit the counters, append the row.
    ///
    /// Returns the committed cost in nanodollars.
    pub async fn record(&self, input: RecordInput) -> u64 {
        let now = Utc::now();
        let tier = self.resolve_tier(input.provider.as_ref());

        // fold tier-less cache writes into the resolved tier
        let mut usage: UsageTokens = input.merged.usage;
        match tier {
            CacheTier::FiveMinute => usage.cache_creation_5m += input.merged.cache_creation_unattributed,
            CacheTier::OneHour => usage.cache_creation_1h += input.merged.cache_creation_unattributed,
        }

        let (cost_nanos, context_1m_applied, billed) = if input.count_tokens {
            (0, false, false)
        } else {
            let multiplier = input
                .provider
                .as_ref()
                .map(|p| p.cost_multiplier)
                .unwrap_or(1.0);
            match self.store.get_price(&input.model).await {
                Ok(Some(price)) => {
                    let breakdown = compute_cost(&price, &usage, multiplier);
                    (breakdown.cost_nanos, breakdown.context_1m_applied, true)
                }
                Ok(None) => {
                    if usage.has_usage() {
                        tracing::warn!(model = %input.model, "No price row for model, recording zero cost");
                    }
                    (0, false, true)
                }
                Err(e) => {
                    tracing::error!(model = %input.model, error = %e, "Price lookup failed, recording zero cost");
                    (0, false, true)
                }
            }
        };

        // counter commits: key, user (carries the RPM tick), provider
        self.limiter
            .commit(
                &Subject::key(input.key.id),
                cost_nanos,
                1,
                input.key.total_cost_reset_at,
                now,
            )
            .await;
        self.limiter
            .commit(
                &Subject::user(input.user.id),
                cost_nanos,
                1,
                input.user.total_cost_reset_at,
                now,
            )
            .await;
        if let Some(provider) = &input.provider {
            self.limiter
                .commit_provider(provider, cost_nanos, now)
                .await;
        }

        let cache_ttl_applied = if usage.cache_creation_5m > 0 || usage.cache_creation_1h > 0 {
            Some(tier.as_str().to_string())
        } else {
            None
        };

        let row = UsageLogRow {
            id: input.request_id,
            key_id: Some(input.key.id),
            user_id: Some(input.user.id),
            provider_id: input.provider.as_ref().map(|p| p.id),
            model: input.model,
            original_model: input.original_model,
            endpoint: input.endpoint,
            status: input.status,
            input_tokens: usage.input,
            output_tokens: usage.output,
            cache_creation_5m_tokens: usage.cache_creation_5m,
            cache_creation_1h_tokens: usage.cache_creation_1h,
            cache_read_tokens: usage.cache_read,
            cache_ttl_applied,
            context_1m_applied,
            cost_nanos,
            billed,
            duration_ms: input.duration_ms,
            ttfb_ms: input.ttfb_ms,
            provider_chain: input.chain,
            blocked_by: input.blocked_by,
            blocked_reason: input.blocked_reason,
            error_message: input.error_message.map(|m| redact(&m)),
            created_at: now,
        };

        // at-least-once append: the row id makes the retry idempotent
        if let Err(first) = self.store.append_usage(&row).await {
            tracing::warn!(row_id = %row.id, error = %first, "Usage row append failed, retrying once");
            if let Err(second) = self.store.append_usage(&row).await {
                tracing::error!(row_id = %row.id, error = %second, "Usage row lost after retry");
            }
        }

        cost_nanos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterStore;
    use crate::limiter::RateLimiter;
    use crate::pricing::{test_price, usd_to_nanos, NANOS_PER_USD};
    use crate::providers::{test_provider, ProviderType};
    use crate::store::Store;
    use crate::tenants::{test_key, test_user};

    struct Fixture {
        store: SharedStore,
        limiter: SharedLimiter,
        recorder: SharedRecorder,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().expect("open"));
        let limiter = RateLimiter::new(CounterStore::new(), 0);
        let recorder = UsageRecorder::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            CacheTier::FiveMinute,
        );
        store
            .upsert_price(&test_price("claude-sonnet-4"))
            .await
            .expect("price");
        Fixture {
            store,
            limiter,
            recorder,
        }
    }

    fn base_input(fx_provider: Provider) -> RecordInput {
        let user = test_user();
        let key = test_key(user.id);
        RecordInput {
            request_id: Uuid::new_v4(),
            key,
            user,
            provider: Some(fx_provider),
            model: "claude-sonnet-4".to_string(),
            original_model: None,
            endpoint: "/v1/messages".to_string(),
            status: Some(200),
            merged: MergedResponse {
                text: "hello".to_string(),
                usage: UsageTokens {
                    input: 1_000,
                    output: 500,
                    ..Default::default()
                },
                cache_creation_unattributed: 0,
                model: None,
            },
            chain: Vec::new(),
            duration_ms: Some(900),
            ttfb_ms: Some(120),
            blocked_by: None,
            blocked_reason: None,
            error_message: None,
            count_tokens: false,
        }
    }

    #[tokio::test]
    async fn cost_committed_to_key_user_and_provider() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let input = base_input(provider.clone());
        let key = input.key.clone();
        let user = input.user.clone();

        let cost = fx.recorder.record(input).await;
        // 1000 * 3000 + 500 * 15000 nanos
        assert_eq!(cost, 10_500_000);

        let now = Utc::now();
        let key_snapshot = fx
            .limiter
            .cost_snapshot(&Subject::key(key.id), key.total_cost_reset_at, now)
            .await;
        let user_snapshot = fx
            .limiter
            .cost_snapshot(&Subject::user(user.id), user.total_cost_reset_at, now)
            .await;
        let expected = cost as f64 / NANOS_PER_USD as f64;
        assert!((key_snapshot.total_usd - expected).abs() < 1e-12);
        assert!((user_snapshot.total_usd - expected).abs() < 1e-12);
        assert!((key_snapshot.daily_usd - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn cost_multiplier_scales_commit() {
        let fx = fixture().await;
        let mut provider = test_provider("p", ProviderType::Claude);
        provider.cost_multiplier = 2.0;
        let cost = fx.recorder.record(base_input(provider)).await;
        assert_eq!(cost, 21_000_000);
    }

    #[tokio::test]
    async fn count_tokens_rows_cost_zero_and_non_billing() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let mut input = base_input(provider);
        input.endpoint = "/v1/messages/count_tokens".to_string();
        input.count_tokens = true;
        let id = input.request_id;

        let cost = fx.recorder.record(input).await;
        assert_eq!(cost, 0);
        let row = fx.store.get_usage(id).await.expect("get").expect("row");
        assert_eq!(row.cost_nanos, 0);
        assert!(!row.billed);
    }

    #[tokio::test]
    async fn unattributed_cache_writes_follow_resolved_tier() {
        let fx = fixture().await;
        let mut provider = test_provider("p", ProviderType::Claude);
        provider.cache_tier = CacheTierPreference::OneHour;
        let mut input = base_input(provider);
        input.merged.cache_creation_unattributed = 400;
        let id = input.request_id;

        fx.recorder.record(input).await;
        let row = fx.store.get_usage(id).await.expect("get").expect("row");
        assert_eq!(row.cache_creation_1h_tokens, 400);
        assert_eq!(row.cache_creation_5m_tokens, 0);
        assert_eq!(row.cache_ttl_applied.as_deref(), Some("1h"));
    }

    #[tokio::test]
    async fn inherit_tier_uses_process_default() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude); // Inherit
        let mut input = base_input(provider);
        input.merged.cache_creation_unattributed = 400;
        let id = input.request_id;

        fx.recorder.record(input).await;
        let row = fx.store.get_usage(id).await.expect("get").expect("row");
        assert_eq!(row.cache_creation_5m_tokens, 400);
        assert_eq!(row.cache_ttl_applied.as_deref(), Some("5m"));
    }

    #[tokio::test]
    async fn unknown_model_records_zero_cost_row() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let mut input = base_input(provider);
        input.model = "not-in-price-table".to_string();
        let id = input.request_id;

        let cost = fx.recorder.record(input).await;
        assert_eq!(cost, 0);
        assert!(fx.store.get_usage(id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn blocked_rows_still_tick_rpm() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let mut input = base_input(provider);
        input.merged = MergedResponse::default();
        input.status = None;
        input.blocked_by = Some("rate_limit".to_string());
        input.blocked_reason = Some("rate_limit_usd_daily".to_string());
        let user_id = input.user.id;

        fx.recorder.record(input).await;
        let counters_cost = fx
            .limiter
            .cost_snapshot(&Subject::user(user_id), Utc::now(), Utc::now())
            .await;
        assert_eq!(counters_cost.total_usd, 0.0);
    }

    #[tokio::test]
    async fn error_message_is_redacted() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let mut input = base_input(provider);
        input.error_message = Some("upstream rejected key sk-ant-REDACTED".to_string());
        let id = input.request_id;

        fx.recorder.record(input).await;
        let row = fx.store.get_usage(id).await.expect("get").expect("row");
        assert!(!row.error_message.unwrap().contains("sk-ant"));
    }

    #[tokio::test]
    async fn provider_counters_respect_usd_conversion() {
        let fx = fixture().await;
        let provider = test_provider("p", ProviderType::Claude);
        let mut input = base_input(provider.clone());
        // force a known round cost: 1M input tokens at $3/M = $3
        input.merged.usage = UsageTokens {
            input: 1_000_000,
            output: 0,
            ..Default::default()
        };
        let cost = fx.recorder.record(input).await;
        assert_eq!(cost, usd_to_nanos(3.0));
    }
}
