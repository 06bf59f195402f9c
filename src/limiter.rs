//! Multi-dimension rate limiter: USD spend windows, RPM, and concurrency.
//!
//! The entry guard evaluates limits in a fixed order (the ordering is a
//! contract; the first violation wins and names the `limitType`):
//!
//! 1. Key total, then User total
//! 2. Key concurrent sessions
//! 3. User RPM
//! 4. Key 5h, then User 5h
//! 5. Key daily, then User daily
//! 6. Key weekly, then User weekly
//! 7. Key monthly, then User monthly
//!
//! Check and commit are not atomic: transient over-admission by one
//! in-flight request is accepted by design.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, FixedOffset, Utc};
use uuid::Uuid;

use crate::counters::{CostQuery, SharedCounters, Subject, SubjectKind};
use crate::pricing::{nanos_to_usd, usd_to_nanos};
use crate::providers::{parse_reset_time, DailyLimitMode, Provider};
use crate::tenants::{ApiKey, User};

const FIVE_HOURS: Duration = Duration::from_secs(5 * 3600);
const TWENTY_FOUR_HOURS: Duration = Duration::from_secs(24 * 3600);

/// Spend/concurrency windows a limit can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    Usd5h,
    UsdDaily,
    UsdWeekly,
    UsdMonthly,
    UsdTotal,
    Rpm,
    ConcurrentSessions,
}

impl LimitType {
    /// The `error.type` value surfaced to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd5h => "rate_limit_usd_5h",
            Self::UsdDaily => "rate_limit_usd_daily",
            Self::UsdWeekly => "rate_limit_usd_weekly",
            Self::UsdMonthly => "rate_limit_usd_monthly",
            Self::UsdTotal => "rate_limit_usd_total",
            Self::Rpm => "rate_limit_rpm",
            Self::ConcurrentSessions => "concurrent_sessions",
        }
    }
}

/// The first violated limit, per the guard ordering.
#[derive(Debug, Clone)]
pub struct LimitViolation {
    pub limit_type: LimitType,
    /// Which record carried the violated limit
    pub scope: SubjectKind,
    /// Current usage: USD for spend windows, a count otherwise
    pub current: f64,
    /// The configured limit in the same unit
    pub limit: f64,
}

/// Current spend of one subject across all windows, in USD.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CostSnapshot {
    pub five_h_usd: f64,
    pub daily_usd: f64,
    pub weekly_usd: f64,
    pub monthly_usd: f64,
    pub total_usd: f64,
}

/// Everything the entry guard needs to know about the caller.
pub struct GuardInput<'a> {
    pub key: &'a ApiKey,
    pub user: &'a User,
    /// Live sessions currently opened under the key
    pub key_active_sessions: usize,
}

/// Shared limiter type.
pub type SharedLimiter = Arc<RateLimiter>;

pub struct RateLimiter {
    counters: SharedCounters,
    /// Fixed offset anchoring calendar windows
    utc_offset_minutes: i32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bucket math
// ─────────────────────────────────────────────────────────────────────────────

fn local_time(now: DateTime<Utc>, offset_minutes: i32) -> DateTime<FixedOffset> {
    let offset =
        FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    now.with_timezone(&offset)
}

/// Daily bucket: the date the window started, shifting the day boundary to
/// `anchor_minutes` past local midnight.
fn daily_bucket(now: DateTime<Utc>, anchor_minutes: u32, offset_minutes: i32) -> String {
    let local = local_time(now, offset_minutes);
    let shifted = local - chrono::Duration::minutes(anchor_minutes as i64);
    format!("{}", shifted.format("%Y-%m-%d"))
}

/// ISO week bucket, e.g. `2026-W31`.
fn weekly_bucket(now: DateTime<Utc>, offset_minutes: i32) -> String {
    let local = local_time(now, offset_minutes);
    let week = local.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Calendar month bucket, e.g. `2026-08`.
fn monthly_bucket(now: DateTime<Utc>, offset_minutes: i32) -> String {
    let local = local_time(now, offset_minutes);
    format!("{}", local.format("%Y-%m"))
}

/// Total bucket, anchored by the subject's reset timestamp so an admin
/// reset starts a fresh bucket.
fn total_bucket(reset_at: DateTime<Utc>) -> String {
    reset_at.timestamp().to_string()
}

fn fixed_key(subject: &Subject, window: &str, bucket: &str) -> String {
    format!("{}:{}:{}", subject.cost_prefix(), window, bucket)
}

impl RateLimiter {
    pub fn new(counters: SharedCounters, utc_offset_minutes: i32) -> Arc<Self> {
        Arc::new(Self {
            counters,
            utc_offset_minutes,
        })
    }

    /// Read a subject's spend across every window in one batched pass.
    pub async fn cost_snapshot(
        &self,
        subject: &Subject,
        total_reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CostSnapshot {
        let off = self.utc_offset_minutes;
        let queries = [
            CostQuery::Rolling { span: FIVE_HOURS },
            CostQuery::Fixed(fixed_key(subject, "daily", &daily_bucket(now, 0, off))),
            CostQuery::Fixed(fixed_key(subject, "weekly", &weekly_bucket(now, off))),
            CostQuery::Fixed(fixed_key(subject, "monthly", &monthly_bucket(now, off))),
            CostQuery::Fixed(fixed_key(subject, "total", &total_bucket(total_reset_at))),
        ];
        let values = self.counters.read_batch(subject, &queries, now).await;
        CostSnapshot {
            five_h_usd: nanos_to_usd(values[0]),
            daily_usd: nanos_to_usd(values[1]),
            weekly_usd: nanos_to_usd(values[2]),
            monthly_usd: nanos_to_usd(values[3]),
            total_usd: nanos_to_usd(values[4]),
        }
    }

    /// The request-entry guard. Returns the first violation in contract
    /// order, or `Ok(())` when every limit holds.
    pub async fn guard(
        &self,
        input: &GuardInput<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), LimitViolation> {
        let key_subject = Subject::key(input.key.id);
        let user_subject = Subject::user(input.user.id);

        let key_costs = self
            .cost_snapshot(&key_subject, input.key.total_cost_reset_at, now)
            .await;
        let user_costs = self
            .cost_snapshot(&user_subject, input.user.total_cost_reset_at, now)
            .await;

        // 1. totals
        check_usd(
            LimitType::UsdTotal,
            SubjectKind::Key,
            key_costs.total_usd,
            input.key.limits.limit_total_usd,
        )?;
        check_usd(
            LimitType::UsdTotal,
            SubjectKind::User,
            user_costs.total_usd,
            input.user.limits.limit_total_usd,
        )?;

        // 2. key concurrency
        if let Some(limit) = input.key.limit_concurrent_sessions {
            if input.key_active_sessions >= limit as usize {
                return Err(LimitViolation {
                    limit_type: LimitType::ConcurrentSessions,
                    scope: SubjectKind::Key,
                    current: input.key_active_sessions as f64,
                    limit: limit as f64,
                });
            }
        }

        // 3. user RPM
        if let Some(limit) = input.user.rpm_limit {
            let current = self.counters.rpm_sliding(input.user.id, now).await;
            if current >= limit {
                return Err(LimitViolation {
                    limit_type: LimitType::Rpm,
                    scope: SubjectKind::User,
                    current: current as f64,
                    limit: limit as f64,
                });
            }
        }

        // 4-7. spend windows, key before user at each step
        let ladder = [
            (LimitType::Usd5h, key_costs.five_h_usd, input.key.limits.limit_5h_usd, user_costs.five_h_usd, input.user.limits.limit_5h_usd),
            (LimitType::UsdDaily, key_costs.daily_usd, input.key.limits.limit_daily_usd, user_costs.daily_usd, input.user.limits.limit_daily_usd),
            (LimitType::UsdWeekly, key_costs.weekly_usd, input.key.limits.limit_weekly_usd, user_costs.weekly_usd, input.user.limits.limit_weekly_usd),
            (LimitType::UsdMonthly, key_costs.monthly_usd, input.key.limits.limit_monthly_usd, user_costs.monthly_usd, input.user.limits.limit_monthly_usd),
        ];
        for (limit_type, key_current, key_limit, user_current, user_limit) in ladder {
            check_usd(limit_type, SubjectKind::Key, key_current, key_limit)?;
            check_usd(limit_type, SubjectKind::User, user_current, user_limit)?;
        }

        Ok(())
    }

    /// Whether a provider is still inside its own spend and concurrency
    /// limits (selection filter).
    pub async fn provider_within_limits(
        &self,
        provider: &Provider,
        active_sessions: usize,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(limit) = provider.limits.limit_concurrent_sessions {
            if active_sessions >= limit as usize {
                return false;
            }
        }

        let subject = Subject::provider(provider.id);
        let off = self.utc_offset_minutes;

        let anchor_minutes = provider
            .limits
            .daily_reset_time
            .as_deref()
            .and_then(parse_reset_time)
            .unwrap_or(0);
        let daily_query = match provider.limits.daily_mode {
            DailyLimitMode::Rolling => CostQuery::Rolling {
                span: TWENTY_FOUR_HOURS,
            },
            DailyLimitMode::Fixed => CostQuery::Fixed(fixed_key(
                &subject,
                "daily",
                &daily_bucket(now, anchor_minutes, off),
            )),
        };
        let queries = [
            CostQuery::Rolling { span: FIVE_HOURS },
            daily_query,
            CostQuery::Fixed(fixed_key(&subject, "weekly", &weekly_bucket(now, off))),
            CostQuery::Fixed(fixed_key(&subject, "monthly", &monthly_bucket(now, off))),
            CostQuery::Fixed(fixed_key(
                &subject,
                "total",
                &total_bucket(provider.total_cost_reset_at),
            )),
        ];
        let values = self.counters.read_batch(&subject, &queries, now).await;

        let limits = [
            provider.limits.limit_5h_usd,
            provider.limits.limit_daily_usd,
            provider.limits.limit_weekly_usd,
            provider.limits.limit_monthly_usd,
            provider.limits.limit_total_usd,
        ];
        for (current_nanos, limit_usd) in values.iter().zip(limits) {
            if let Some(limit_usd) = limit_usd {
                if *current_nanos >= usd_to_nanos(limit_usd) {
                    return false;
                }
            }
        }
        true
    }

    /// Add spend to every active window of a subject, plus the RPM counter
    /// for user subjects.
    pub async fn commit(
        &self,
        subject: &Subject,
        cost_nanos: u64,
        request_count: u32,
        total_reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let off = self.utc_offset_minutes;
        let fixed_keys = vec![
            fixed_key(subject, "daily", &daily_bucket(now, 0, off)),
            fixed_key(subject, "weekly", &weekly_bucket(now, off)),
            fixed_key(subject, "monthly", &monthly_bucket(now, off)),
            fixed_key(subject, "total", &total_bucket(total_reset_at)),
        ];
        self.counters
            .commit_cost(subject, &fixed_keys, cost_nanos, now)
            .await;
        if subject.kind == SubjectKind::User {
            for _ in 0..request_count {
                self.counters.incr_rpm(subject.id, now).await;
            }
        }
    }

    /// Provider-anchored commit: also writes the provider's fixed daily
    /// bucket at its configured anchor, so fixed-mode daily limits read the
    /// right key.
    pub async fn commit_provider(
        &self,
        provider: &Provider,
        cost_nanos: u64,
        now: DateTime<Utc>,
    ) {
        let subject = Subject::provider(provider.id);
        let off = self.utc_offset_minutes;
        let anchor_minutes = provider
            .limits
            .daily_reset_time
            .as_deref()
            .and_then(parse_reset_time)
            .unwrap_or(0);
        let fixed_keys = vec![
            fixed_key(&subject, "daily", &daily_bucket(now, anchor_minutes, off)),
            fixed_key(&subject, "weekly", &weekly_bucket(now, off)),
            fixed_key(&subject, "monthly", &monthly_bucket(now, off)),
            fixed_key(
                &subject,
                "total",
                &total_bucket(provider.total_cost_reset_at),
            ),
        ];
        self.counters
            .commit_cost(&subject, &fixed_keys, cost_nanos, now)
            .await;
    }

    /// Batched per-provider spend snapshot for the admin surface.
    pub async fn current_cost_batch(
        &self,
        providers: &[Provider],
        now: DateTime<Utc>,
    ) -> Vec<(Uuid, CostSnapshot)> {
        let mut out = Vec::with_capacity(providers.len());
        for p in providers {
            let snapshot = self
                .cost_snapshot(&Subject::provider(p.id), p.total_cost_reset_at, now)
                .await;
            out.push((p.id, snapshot));
        }
        out
    }
}

fn check_usd(
    limit_type: LimitType,
    scope: SubjectKind,
    current_usd: f64,
    limit_usd: Option<f64>,
) -> Result<(), LimitViolation> {
    if let Some(limit) = limit_usd {
        if current_usd >= limit {
            return Err(LimitViolation {
                limit_type,
                scope,
                current: current_usd,
                limit,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterStore;
    use crate::providers::{test_provider, ProviderType};
    use crate::tenants::{test_key, test_user};

    fn limiter() -> SharedLimiter {
        RateLimiter::new(CounterStore::new(), 0)
    }

    #[tokio::test]
    async fn guard_passes_with_no_limits() {
        let limiter = limiter();
        let user = test_user();
        let key = test_key(user.id);
        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        assert!(limiter.guard(&input, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn daily_limit_blocks_at_boundary() {
        let limiter = limiter();
        let user = test_user();
        let mut key = test_key(user.id);
        key.limits.limit_daily_usd = Some(10.0);
        let now = Utc::now();

        limiter
            .commit(
                &Subject::key(key.id),
                usd_to_nanos(10.0),
                1,
                key.total_cost_reset_at,
                now,
            )
            .await;

        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        let violation = limiter.guard(&input, now).await.unwrap_err();
        assert_eq!(violation.limit_type, LimitType::UsdDaily);
        assert_eq!(violation.scope, SubjectKind::Key);
        assert_eq!(violation.limit_type.as_str(), "rate_limit_usd_daily");
        assert!((violation.current - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn first_violation_wins_in_contract_order() {
        let limiter = limiter();
        let mut user = test_user();
        let mut key = test_key(user.id);
        // violate total (step 1) and daily (step 5) together: total must win
        key.limits.limit_total_usd = Some(5.0);
        key.limits.limit_daily_usd = Some(5.0);
        user.rpm_limit = Some(1);
        let now = Utc::now();

        limiter
            .commit(
                &Subject::key(key.id),
                usd_to_nanos(6.0),
                1,
                key.total_cost_reset_at,
                now,
            )
            .await;

        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        let violation = limiter.guard(&input, now).await.unwrap_err();
        assert_eq!(violation.limit_type, LimitType::UsdTotal);
    }

    #[tokio::test]
    async fn concurrency_checked_before_rpm() {
        let limiter = limiter();
        let mut user = test_user();
        let mut key = test_key(user.id);
        key.limit_concurrent_sessions = Some(2);
        user.rpm_limit = Some(0);
        let now = Utc::now();

        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 2,
        };
        let violation = limiter.guard(&input, now).await.unwrap_err();
        assert_eq!(violation.limit_type, LimitType::ConcurrentSessions);
        assert_eq!(violation.limit_type.as_str(), "concurrent_sessions");
    }

    #[tokio::test]
    async fn user_rpm_violation_reported() {
        let limiter = limiter();
        let mut user = test_user();
        user.rpm_limit = Some(2);
        let key = test_key(user.id);
        let now = Utc::now();

        for _ in 0..2 {
            limiter
                .commit(&Subject::user(user.id), 0, 1, user.total_cost_reset_at, now)
                .await;
        }
        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        let violation = limiter.guard(&input, now).await.unwrap_err();
        assert_eq!(violation.limit_type, LimitType::Rpm);
        assert_eq!(violation.scope, SubjectKind::User);
    }

    #[tokio::test]
    async fn user_daily_checked_even_when_key_daily_unset() {
        let limiter = limiter();
        let mut user = test_user();
        user.limits.limit_daily_usd = Some(1.0);
        let key = test_key(user.id);
        let now = Utc::now();

        limiter
            .commit(
                &Subject::user(user.id),
                usd_to_nanos(2.0),
                1,
                user.total_cost_reset_at,
                now,
            )
            .await;

        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        let violation = limiter.guard(&input, now).await.unwrap_err();
        assert_eq!(violation.limit_type, LimitType::UsdDaily);
        assert_eq!(violation.scope, SubjectKind::User);
    }

    #[tokio::test]
    async fn admin_total_reset_starts_a_fresh_bucket() {
        let limiter = limiter();
        let user = test_user();
        let mut key = test_key(user.id);
        key.limits.limit_total_usd = Some(5.0);
        let now = Utc::now();

        limiter
            .commit(
                &Subject::key(key.id),
                usd_to_nanos(6.0),
                1,
                key.total_cost_reset_at,
                now,
            )
            .await;
        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        assert!(limiter.guard(&input, now).await.is_err());

        // reset anchors the total window at a new timestamp
        key.total_cost_reset_at = now + chrono::Duration::seconds(1);
        let input = GuardInput {
            key: &key,
            user: &user,
            key_active_sessions: 0,
        };
        assert!(limiter.guard(&input, now).await.is_ok());
    }

    #[tokio::test]
    async fn provider_rolling_daily_vs_fixed_daily() {
        let limiter = limiter();
        let mut provider = test_provider("p", ProviderType::Claude);
        provider.limits.limit_daily_usd = Some(10.0);
        let now = Utc::now();

        // spend 23 hours ago: inside rolling 24h, outside today's fixed bucket
        let earlier = now - chrono::Duration::hours(23);
        limiter
            .commit_provider(&provider, usd_to_nanos(12.0), earlier)
            .await;

        provider.limits.daily_mode = DailyLimitMode::Rolling;
        assert!(!limiter.provider_within_limits(&provider, 0, now).await);

        provider.limits.daily_mode = DailyLimitMode::Fixed;
        // the fixed bucket for `now` may or may not include `earlier`
        // depending on the calendar day; anchor the test by checking the
        // bucket keys differ when the day rolled over
        let same_day = daily_bucket(now, 0, 0) == daily_bucket(earlier, 0, 0);
        assert_eq!(
            limiter.provider_within_limits(&provider, 0, now).await,
            !same_day
        );
    }

    #[tokio::test]
    async fn provider_concurrency_filters() {
        let limiter = limiter();
        let mut provider = test_provider("p", ProviderType::Claude);
        provider.limits.limit_concurrent_sessions = Some(2);
        let now = Utc::now();
        assert!(limiter.provider_within_limits(&provider, 1, now).await);
        assert!(!limiter.provider_within_limits(&provider, 2, now).await);
    }

    #[test]
    fn bucket_shapes() {
        let t = DateTime::parse_from_rfc3339("2026-08-01T12:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(daily_bucket(t, 0, 0), "2026-08-01");
        // 13:00 anchor: at 12:30 we are still in the July 31 window
        assert_eq!(daily_bucket(t, 13 * 60, 0), "2026-07-31");
        assert_eq!(monthly_bucket(t, 0), "2026-08");
        assert_eq!(weekly_bucket(t, 0), "2026-W31");
        // +90 min offset rolls the local calendar forward
        assert_eq!(daily_bucket(t, 0, 90), "2026-08-01");
    }
}
