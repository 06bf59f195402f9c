//! Provider selection: filter funnel, session affinity, priority buckets,
//! and the weighted pick.
//!
//! Each request gets one selection pass over a registry snapshot. The
//! funnel sizes and the candidate probabilities are captured into the
//! decision context recorded on the provider chain.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::breaker::{Admission, SharedBreaker};
use crate::chain::{CandidateSnapshot, ChainReason, DecisionContext, SelectionFunnel};
use crate::limiter::SharedLimiter;
use crate::providers::{Provider, TargetProtocol};
use crate::sessions::SharedSessions;

/// What the selector needs to know about one request.
pub struct SelectionInput<'a> {
    pub target: TargetProtocol,
    /// Client-requested model; allow-lists are checked against each
    /// provider's post-redirect name
    pub model: &'a str,
    pub key_scope: &'a HashSet<String>,
    pub user_scope: &'a HashSet<String>,
    pub session_id: Option<&'a str>,
    /// Providers already tried in this request (retry driver)
    pub exclude: &'a HashSet<Uuid>,
}

/// A successful selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Provider,
    /// `initial_selection`, or `session_reuse` when an affinity pin won
    pub reason: ChainReason,
    pub context: DecisionContext,
}

/// No provider survived the funnel.
#[derive(Debug, Clone)]
pub struct NoAvailableProvider {
    pub funnel: SelectionFunnel,
}

/// Shared selector type.
pub type SharedSelector = Arc<ProviderSelector>;

pub struct ProviderSelector {
    breaker: SharedBreaker,
    limiter: SharedLimiter,
    sessions: SharedSessions,
}

impl ProviderSelector {
    pub fn new(
        breaker: SharedBreaker,
        limiter: SharedLimiter,
        sessions: SharedSessions,
    ) -> Arc<Self> {
        Arc::new(Self {
            breaker,
            limiter,
            sessions,
        })
    }

    /// Run the selection funnel over a registry snapshot.
    ///
    /// The chosen provider's breaker admission is claimed before returning;
    /// the caller must report the outcome (or release the probe) so the
    /// HALF_OPEN slot is not leaked.
    pub async fn select(
        &self,
        providers: &[Provider],
        input: &SelectionInput<'_>,
        now: DateTime<Utc>,
    ) -> Result<Selection, NoAvailableProvider> {
        let mut funnel = SelectionFunnel {
            total: providers.len(),
            ..Default::default()
        };

        // 1. protocol
        let mut survivors: Vec<&Provider> =
            providers.iter().filter(|p| p.serves(input.target)).collect();
        funnel.after_protocol = survivors.len();

        // 2. enabled
        survivors.retain(|p| p.enabled);
        funnel.after_enabled = survivors.len();

        // 3. group scope (key and user each apply; wildcard disables)
        survivors.retain(|p| p.in_scope(input.key_scope) && p.in_scope(input.user_scope));
        funnel.after_group = survivors.len();

        // 4. allow-list, after each provider's own redirect
        survivors.retain(|p| p.allows_model(p.redirect_model(input.model)));
        funnel.after_allow_list = survivors.len();

        // already-tried providers drop out on retry passes
        survivors.retain(|p| !input.exclude.contains(&p.id));
        funnel.after_exclusions = survivors.len();

        // 5. health: drop OPEN (an expired OPEN becomes a probe candidate);
        // HALF_OPEN stays in only while the probe slot is free
        let mut healthy = Vec::with_capacity(survivors.len());
        for p in survivors {
            if self.breaker.would_admit(p.id, now).await {
                healthy.push(p);
            }
        }
        funnel.after_health = healthy.len();

        // provider-level spend/concurrency limits
        let mut within_limits = Vec::with_capacity(healthy.len());
        for p in healthy {
            let active = self.sessions.count_by_provider(p.id, now).await;
            if self.limiter.provider_within_limits(p, active, now).await {
                within_limits.push(p);
            }
        }
        funnel.after_limits = within_limits.len();

        if within_limits.is_empty() {
            return Err(NoAvailableProvider { funnel });
        }

        // 6. session affinity
        if let Some(session_id) = input.session_id {
            if let Some(pinned) = self.sessions.pinned_provider(session_id, now).await {
                if let Some(p) = within_limits.iter().find(|p| p.id == pinned) {
                    if self.breaker.admit(p.id, now).await != Admission::Skip {
                        let provider = (*p).clone();
                        let context = DecisionContext {
                            candidates: vec![CandidateSnapshot {
                                provider_id: provider.id,
                                provider_name: provider.name.clone(),
                                weight: provider.weight,
                                probability: 1.0,
                            }],
                            funnel,
                            priority: provider.priority,
                        };
                        return Ok(Selection {
                            provider,
                            reason: ChainReason::SessionReuse,
                            context,
                        });
                    }
                }
            }
        }

        // 7-8. lowest priority bucket, weighted pick; if claiming the
        // admission races with another request (HALF_OPEN probe), drop the
        // loser and draw again
        let mut pool = within_limits;
        loop {
            let Some(min_priority) = pool.iter().map(|p| p.priority).min() else {
                return Err(NoAvailableProvider { funnel });
            };
            let bucket: Vec<&Provider> = pool
                .iter()
                .filter(|p| p.priority == min_priority)
                .copied()
                .collect();

            let candidates = candidate_probabilities(&bucket);
            let chosen_id = {
                let mut rng = rand::thread_rng();
                weighted_pick(&bucket, &mut rng).id
            };

            if self.breaker.admit(chosen_id, now).await == Admission::Skip {
                pool.retain(|p| p.id != chosen_id);
                continue;
            }

            let provider = bucket
                .iter()
                .find(|p| p.id == chosen_id)
                .map(|p| (*p).clone())
                .expect("chosen provider is in its bucket");
            let context = DecisionContext {
                candidates,
                funnel,
                priority: min_priority,
            };
            return Ok(Selection {
                provider,
                reason: ChainReason::InitialSelection,
                context,
            });
        }
    }
}

/// Selection probabilities for one priority bucket, `weight / Σweight`;
/// uniform when every weight is zero.
fn candidate_probabilities(bucket: &[&Provider]) -> Vec<CandidateSnapshot> {
    let total: u64 = bucket.iter().map(|p| p.weight as u64).sum();
    bucket
        .iter()
        .map(|p| CandidateSnapshot {
            provider_id: p.id,
            provider_name: p.name.clone(),
            weight: p.weight,
            probability: if total == 0 {
                1.0 / bucket.len() as f64
            } else {
                p.weight as f64 / total as f64
            },
        })
        .collect()
}

/// Sample one provider from a bucket proportionally to weight.
fn weighted_pick<'a, R: Rng>(bucket: &[&'a Provider], rng: &mut R) -> &'a Provider {
    let total: u64 = bucket.iter().map(|p| p.weight as u64).sum();
    if total == 0 {
        return bucket[rng.gen_range(0..bucket.len())];
    }
    let mut draw = rng.gen_range(0..total);
    for p in bucket {
        let w = p.weight as u64;
        if draw < w {
            return p;
        }
        draw -= w;
    }
    bucket[bucket.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::counters::CounterStore;
    use crate::limiter::RateLimiter;
    use crate::providers::{test_provider, ProviderType, DEFAULT_GROUP, GROUP_WILDCARD};
    use crate::sessions::{SessionTracker, DEFAULT_SESSION_TTL};
    use crate::store::Store;

    struct Fixture {
        selector: SharedSelector,
        breaker: SharedBreaker,
        sessions: SharedSessions,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().expect("open"));
        let breaker = CircuitBreaker::new(store);
        let limiter = RateLimiter::new(CounterStore::new(), 0);
        let sessions = SessionTracker::new();
        Fixture {
            selector: ProviderSelector::new(
                Arc::clone(&breaker),
                limiter,
                Arc::clone(&sessions),
            ),
            breaker,
            sessions,
        }
    }

    fn scopes() -> (HashSet<String>, HashSet<String>) {
        let key: HashSet<String> = std::iter::once(DEFAULT_GROUP.to_string()).collect();
        let user: HashSet<String> = std::iter::once(GROUP_WILDCARD.to_string()).collect();
        (key, user)
    }

    fn input<'a>(
        key_scope: &'a HashSet<String>,
        user_scope: &'a HashSet<String>,
        exclude: &'a HashSet<Uuid>,
    ) -> SelectionInput<'a> {
        SelectionInput {
            target: TargetProtocol::Anthropic,
            model: "claude-sonnet-4",
            key_scope,
            user_scope,
            session_id: None,
            exclude,
        }
    }

    #[tokio::test]
    async fn lowest_priority_bucket_wins() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let mut p0 = test_provider("first", ProviderType::Claude);
        p0.priority = 0;
        let mut p1 = test_provider("second", ProviderType::Claude);
        p1.priority = 1;
        let providers = vec![p1.clone(), p0.clone()];

        let got = fx
            .selector
            .select(
                &providers,
                &input(&key_scope, &user_scope, &exclude),
                Utc::now(),
            )
            .await
            .expect("selection");
        assert_eq!(got.provider.id, p0.id);
        assert_eq!(got.reason, ChainReason::InitialSelection);
        assert_eq!(got.context.priority, 0);
        assert_eq!(got.context.funnel.after_protocol, 2);
    }

    #[tokio::test]
    async fn open_provider_is_never_chosen() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let p0 = test_provider("broken", ProviderType::Claude);
        let mut p1 = test_provider("healthy", ProviderType::Claude);
        p1.priority = 1;
        let providers = vec![p0.clone(), p1.clone()];
        let now = Utc::now();

        for _ in 0..p0.breaker.failure_threshold {
            fx.breaker.on_failure(p0.id, &p0.breaker, now, None).await;
        }

        for _ in 0..20 {
            let got = fx
                .selector
                .select(&providers, &input(&key_scope, &user_scope, &exclude), now)
                .await
                .expect("selection");
            assert_eq!(got.provider.id, p1.id);
        }
    }

    #[tokio::test]
    async fn disabled_group_and_allow_list_filters() {
        let fx = fixture();
        let exclude = HashSet::new();
        let user_scope: HashSet<String> = std::iter::once(GROUP_WILDCARD.to_string()).collect();
        let key_scope: HashSet<String> = std::iter::once("premium".to_string()).collect();

        let mut disabled = test_provider("off", ProviderType::Claude);
        disabled.enabled = false;
        let wrong_group = test_provider("basic", ProviderType::Claude);
        let mut wrong_model = test_provider("narrow", ProviderType::Claude);
        wrong_model.group_tags.insert("premium".to_string());
        wrong_model.allowed_models = vec!["other-model".to_string()];
        let mut good = test_provider("good", ProviderType::Claude);
        good.group_tags.insert("premium".to_string());

        let providers = vec![disabled, wrong_group, wrong_model, good.clone()];
        let got = fx
            .selector
            .select(
                &providers,
                &input(&key_scope, &user_scope, &exclude),
                Utc::now(),
            )
            .await
            .expect("selection");
        assert_eq!(got.provider.id, good.id);
        assert_eq!(got.context.funnel.after_enabled, 3);
        assert_eq!(got.context.funnel.after_group, 2);
        assert_eq!(got.context.funnel.after_allow_list, 1);
    }

    #[tokio::test]
    async fn redirect_applies_before_allow_list() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let mut p = test_provider("redirecting", ProviderType::Claude);
        p.model_redirects
            .insert("claude-sonnet-4".to_string(), "claude-opus-4".to_string());
        p.allowed_models = vec!["claude-opus-4".to_string()];
        let providers = vec![p.clone()];

        let got = fx
            .selector
            .select(
                &providers,
                &input(&key_scope, &user_scope, &exclude),
                Utc::now(),
            )
            .await
            .expect("selection");
        assert_eq!(got.provider.id, p.id);
    }

    #[tokio::test]
    async fn session_affinity_reuses_pinned_provider() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let mut heavy = test_provider("heavy", ProviderType::Claude);
        heavy.weight = 1000;
        let pinned = test_provider("pinned", ProviderType::Claude);
        let providers = vec![heavy, pinned.clone()];
        let now = Utc::now();

        fx.sessions
            .open_session(pinned.id, Uuid::new_v4(), "sess-1", DEFAULT_SESSION_TTL, now)
            .await;

        let mut sel_input = input(&key_scope, &user_scope, &exclude);
        sel_input.session_id = Some("sess-1");
        let got = fx
            .selector
            .select(&providers, &sel_input, now)
            .await
            .expect("selection");
        assert_eq!(got.provider.id, pinned.id);
        assert_eq!(got.reason, ChainReason::SessionReuse);
        assert_eq!(got.context.candidates.len(), 1);
        assert!((got.context.candidates[0].probability - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn affinity_ignored_when_pin_filtered_out() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let mut pinned = test_provider("pinned", ProviderType::Claude);
        pinned.enabled = false;
        let other = test_provider("other", ProviderType::Claude);
        let providers = vec![pinned.clone(), other.clone()];
        let now = Utc::now();

        fx.sessions
            .open_session(pinned.id, Uuid::new_v4(), "sess-1", DEFAULT_SESSION_TTL, now)
            .await;

        let mut sel_input = input(&key_scope, &user_scope, &exclude);
        sel_input.session_id = Some("sess-1");
        let got = fx
            .selector
            .select(&providers, &sel_input, now)
            .await
            .expect("selection");
        assert_eq!(got.provider.id, other.id);
        assert_eq!(got.reason, ChainReason::InitialSelection);
    }

    #[tokio::test]
    async fn excluded_providers_skipped_on_retry() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let p0 = test_provider("tried", ProviderType::Claude);
        let mut p1 = test_provider("fresh", ProviderType::Claude);
        p1.priority = 1;
        let providers = vec![p0.clone(), p1.clone()];
        let exclude: HashSet<Uuid> = std::iter::once(p0.id).collect();

        let got = fx
            .selector
            .select(
                &providers,
                &input(&key_scope, &user_scope, &exclude),
                Utc::now(),
            )
            .await
            .expect("selection");
        assert_eq!(got.provider.id, p1.id);
    }

    #[tokio::test]
    async fn empty_funnel_reports_no_available_provider() {
        let fx = fixture();
        let (key_scope, user_scope) = scopes();
        let exclude = HashSet::new();
        let p = test_provider("gemini-only", ProviderType::Gemini);
        let err = fx
            .selector
            .select(
                &[p],
                &input(&key_scope, &user_scope, &exclude),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.funnel.total, 1);
        assert_eq!(err.funnel.after_protocol, 0);
    }

    #[test]
    fn probabilities_normalize() {
        let mut a = test_provider("a", ProviderType::Claude);
        a.weight = 75;
        let mut b = test_provider("b", ProviderType::Claude);
        b.weight = 25;
        let bucket = [&a, &b];
        let got = candidate_probabilities(&bucket);
        assert!((got[0].probability - 0.75).abs() < 1e-9);
        assert!((got[1].probability - 0.25).abs() < 1e-9);

        let mut z1 = test_provider("z1", ProviderType::Claude);
        z1.weight = 0;
        let mut z2 = test_provider("z2", ProviderType::Claude);
        z2.weight = 0;
        let got = candidate_probabilities(&[&z1, &z2]);
        assert!((got[0].probability - 0.5).abs() < 1e-9);
    }

    #[test]
    fn weighted_pick_converges_to_weights() {
        let mut a = test_provider("a", ProviderType::Claude);
        a.weight = 70;
        let mut b = test_provider("b", ProviderType::Claude);
        b.weight = 30;
        let bucket = [&a, &b];

        let mut rng = rand::rngs::mock::StepRng::new(0, 0x9e3779b97f4a7c15);
        let n = 10_000;
        let mut hits_a = 0u32;
        for _ in 0..n {
            if weighted_pick(&bucket, &mut rng).id == a.id {
                hits_a += 1;
            }
        }
        // expect 7000 with sigma = sqrt(n * 0.7 * 0.3) ~ 46; allow 3 sigma
        let expected = 7_000.0;
        let sigma = (n as f64 * 0.7 * 0.3).sqrt();
        assert!(
            ((hits_a as f64) - expected).abs() < 3.0 * sigma,
            "hits_a = {}",
            hits_a
        );
    }
}
