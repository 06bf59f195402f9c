//! Admin-surface contracts consumed by the core.
//!
//! Thin JSON endpoints over the row stores: provider CRUD, breaker
//! configuration and reset, spend snapshots, key/user management, and the
//! price table. Every mutation of provider records publishes a cache
//! invalidation. The admin UI itself lives elsewhere; these are the
//! contracts it calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::verify_admin;
use super::routes::AppState;
use crate::breaker::BreakerHealth;
use crate::limiter::CostSnapshot;
use crate::pricing::ModelPrice;
use crate::providers::{
    BreakerConfig, CacheTierPreference, EgressPolicy, Provider, ProviderLimits, ProviderType,
    ThroughputHints, TimeoutOverrides, DEFAULT_GROUP,
};
use crate::tenants::{generate_key, hash_key, ApiKey, SpendLimits, User};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/providers", get(list_providers).post(create_provider))
        .route(
            "/providers/health",
            get(providers_health),
        )
        .route("/providers/cost", get(providers_cost))
        .route(
            "/providers/:id",
            get(get_provider).put(update_provider).delete(delete_provider),
        )
        .route(
            "/providers/:id/breaker",
            put(save_breaker_config).delete(delete_breaker_config),
        )
        .route("/providers/:id/breaker/reset", post(reset_breaker))
        .route("/providers/:id/reset-total", post(reset_total))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/:id", delete(delete_key))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", delete(delete_user))
        .route("/prices/:model", put(upsert_price))
        .route("/cache/invalidate", post(invalidate_cache))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "invalid admin token").into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    tracing::error!(error = %e, "Admin operation failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "storage error").into_response()
}

macro_rules! require_admin {
    ($headers:expr, $state:expr) => {
        if !verify_admin(&$headers, &$state.config.admin_token) {
            return unauthorized();
        }
    };
}

// ─────────────────────────────────────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────────────────────────────────────

/// Provider fields accepted on create/update; identity and lifecycle
/// timestamps are server-assigned.
#[derive(Debug, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub url: String,
    pub provider_type: ProviderType,
    pub api_key: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub group_tags: HashSet<String>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    #[serde(default)]
    pub join_claude_pool: bool,
    #[serde(default)]
    pub limits: ProviderLimits,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub egress: EgressPolicy,
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
    #[serde(default)]
    pub hints: ThroughputHints,
    #[serde(default)]
    pub cache_tier: CacheTierPreference,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
}

fn default_enabled() -> bool {
    true
}
fn default_weight() -> u32 {
    1
}
fn default_multiplier() -> f64 {
    1.0
}

impl ProviderSpec {
    fn into_provider(self, id: Uuid, existing: Option<&Provider>) -> Provider {
        let now = Utc::now();
        let mut group_tags = self.group_tags;
        group_tags.insert(DEFAULT_GROUP.to_string());
        Provider {
            id,
            name: self.name,
            url: self.url,
            provider_type: self.provider_type,
            api_key: self.api_key,
            client_id: self.client_id,
            enabled: self.enabled,
            priority: self.priority,
            weight: self.weight,
            cost_multiplier: self.cost_multiplier,
            group_tags,
            allowed_models: self.allowed_models,
            model_redirects: self.model_redirects,
            join_claude_pool: self.join_claude_pool,
            limits: self.limits,
            breaker: self.breaker,
            egress: self.egress,
            timeouts: self.timeouts,
            hints: self.hints,
            cache_tier: self.cache_tier,
            max_retry_attempts: self.max_retry_attempts,
            total_cost_reset_at: existing.map(|p| p.total_cost_reset_at).unwrap_or(now),
            created_at: existing.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        }
    }
}

async fn list_providers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    match state.store.list_providers().await {
        Ok(providers) => Json(providers).into_response(),
        Err(e) => internal(e),
    }
}

async fn get_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    match state.store.get_provider(id).await {
        Ok(Some(provider)) => Json(provider).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(spec): Json<ProviderSpec>,
) -> Response {
    require_admin!(headers, state);
    let provider = spec.into_provider(Uuid::new_v4(), None);
    if let Err(message) = provider.validate() {
        return (StatusCode::BAD_REQUEST, message).into_response();
    }
    if let Err(e) = state.store.upsert_provider(&provider).await {
        return internal(e);
    }
    state.bus.publish_provider_invalidation();
    (StatusCode::CREATED, Json(provider)).into_response()
}

async fn update_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(spec): Json<ProviderSpec>,
) -> Response {
    require_admin!(headers, state);
    let existing = match state.store.get_provider(id).await {
        Ok(Some(p)) => p,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal(e),
    };
    let provider = spec.into_provider(id, Some(&existing));
    if let Err(message) = provider.validate() {
        return (StatusCode::BAD_REQUEST, message).into_response();
    }
    if let Err(e) = state.store.upsert_provider(&provider).await {
        return internal(e);
    }
    state.bus.publish_provider_invalidation();
    Json(provider).into_response()
}

async fn delete_provider(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    match state.store.delete_provider(id).await {
        Ok(true) => {
            let _ = state.store.delete_breaker(id).await;
            state.bus.publish_provider_invalidation();
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Breaker operations
// ─────────────────────────────────────────────────────────────────────────────

async fn save_breaker_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(cfg): Json<BreakerConfig>,
) -> Response {
    require_admin!(headers, state);
    let mut provider = match state.store.get_provider(id).await {
        Ok(Some(p)) => p,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal(e),
    };
    provider.breaker = cfg;
    provider.updated_at = Utc::now();
    if let Err(e) = state.store.upsert_provider(&provider).await {
        return internal(e);
    }
    state.bus.publish_provider_invalidation();
    Json(provider.breaker).into_response()
}

async fn delete_breaker_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    let mut provider = match state.store.get_provider(id).await {
        Ok(Some(p)) => p,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => return internal(e),
    };
    provider.breaker = BreakerConfig::default();
    provider.updated_at = Utc::now();
    if let Err(e) = state.store.upsert_provider(&provider).await {
        return internal(e);
    }
    state.bus.publish_provider_invalidation();
    StatusCode::NO_CONTENT.into_response()
}

async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    state.breaker.reset(id, Utc::now()).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    providers: Vec<BreakerHealth>,
}

async fn providers_health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    let providers = match state.store.list_providers().await {
        Ok(providers) => providers,
        Err(e) => return internal(e),
    };
    let ids: Vec<Uuid> = providers.iter().map(|p| p.id).collect();
    let snapshot = state.breaker.health_snapshot(&ids, Utc::now()).await;
    Json(HealthResponse {
        providers: snapshot,
    })
    .into_response()
}

#[derive(Serialize)]
struct CostRow {
    provider_id: Uuid,
    #[serde(flatten)]
    cost: CostSnapshot,
}

async fn providers_cost(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    let providers = match state.store.list_providers().await {
        Ok(providers) => providers,
        Err(e) => return internal(e),
    };
    let batch = state
        .limiter
        .current_cost_batch(&providers, Utc::now())
        .await;
    let rows: Vec<CostRow> = batch
        .into_iter()
        .map(|(provider_id, cost)| CostRow { provider_id, cost })
        .collect();
    Json(rows).into_response()
}

async fn reset_total(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    match state
        .store
        .reset_provider_total_anchor(id, Utc::now())
        .await
    {
        Ok(true) => {
            state.bus.publish_provider_invalidation();
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Keys
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    user_id: Uuid,
    #[serde(default)]
    limits: SpendLimits,
    #[serde(default)]
    limit_concurrent_sessions: Option<u32>,
    #[serde(default)]
    provider_groups: HashSet<String>,
}

/// The raw key value is returned exactly once, at creation.
#[derive(Serialize)]
struct CreateKeyResponse {
    id: Uuid,
    name: String,
    key: String,
    key_prefix: String,
}

#[derive(Serialize)]
struct KeySummary {
    id: Uuid,
    user_id: Uuid,
    name: String,
    key_prefix: String,
    enabled: bool,
}

async fn list_keys(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    match state.store.list_keys().await {
        Ok(keys) => {
            let summaries: Vec<KeySummary> = keys
                .into_iter()
                .map(|k| KeySummary {
                    id: k.id,
                    user_id: k.user_id,
                    name: k.name,
                    key_prefix: k.key_prefix,
                    enabled: k.enabled,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => internal(e),
    }
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    require_admin!(headers, state);
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    match state.store.get_user(req.user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::BAD_REQUEST, "unknown user").into_response(),
        Err(e) => return internal(e),
    }

    let (raw, prefix) = generate_key();
    let mut provider_groups = req.provider_groups;
    if provider_groups.is_empty() {
        provider_groups.insert(DEFAULT_GROUP.to_string());
    }
    let key = ApiKey {
        id: Uuid::new_v4(),
        user_id: req.user_id,
        name: name.clone(),
        key_hash: hash_key(&raw),
        key_prefix: prefix.clone(),
        enabled: true,
        limits: req.limits,
        limit_concurrent_sessions: req.limit_concurrent_sessions,
        provider_groups,
        total_cost_reset_at: Utc::now(),
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.upsert_key(&key).await {
        return internal(e);
    }
    (
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            id: key.id,
            name,
            key: raw,
            key_prefix: prefix,
        }),
    )
        .into_response()
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    match state.store.delete_key(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    name: String,
    #[serde(default)]
    limits: SpendLimits,
    #[serde(default)]
    rpm_limit: Option<u32>,
    #[serde(default)]
    provider_groups: HashSet<String>,
}

async fn list_users(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    match state.store.list_users().await {
        Ok(users) => Json(users).into_response(),
        Err(e) => internal(e),
    }
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Response {
    require_admin!(headers, state);
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "name is required").into_response();
    }
    let mut provider_groups = req.provider_groups;
    if provider_groups.is_empty() {
        provider_groups.insert(DEFAULT_GROUP.to_string());
    }
    let user = User {
        id: Uuid::new_v4(),
        name,
        enabled: true,
        limits: req.limits,
        rpm_limit: req.rpm_limit,
        provider_groups,
        total_cost_reset_at: Utc::now(),
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.upsert_user(&user).await {
        return internal(e);
    }
    (StatusCode::CREATED, Json(user)).into_response()
}

async fn delete_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Response {
    require_admin!(headers, state);
    match state.store.delete_user(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prices & cache
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PriceSpec {
    input_usd_per_mtok: f64,
    output_usd_per_mtok: f64,
    #[serde(default)]
    cache_write_5m_usd_per_mtok: f64,
    #[serde(default)]
    cache_write_1h_usd_per_mtok: f64,
    #[serde(default)]
    cache_read_usd_per_mtok: f64,
    #[serde(default)]
    supports_1m_context: bool,
}

async fn upsert_price(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model): Path<String>,
    Json(spec): Json<PriceSpec>,
) -> Response {
    require_admin!(headers, state);
    let price = ModelPrice {
        model,
        input_usd_per_mtok: spec.input_usd_per_mtok,
        output_usd_per_mtok: spec.output_usd_per_mtok,
        cache_write_5m_usd_per_mtok: spec.cache_write_5m_usd_per_mtok,
        cache_write_1h_usd_per_mtok: spec.cache_write_1h_usd_per_mtok,
        cache_read_usd_per_mtok: spec.cache_read_usd_per_mtok,
        supports_1m_context: spec.supports_1m_context,
        updated_at: Utc::now(),
    };
    match state.store.upsert_price(&price).await {
        Ok(()) => Json(price).into_response(),
        Err(e) => internal(e),
    }
}

async fn invalidate_cache(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    require_admin!(headers, state);
    state.bus.publish_provider_invalidation();
    StatusCode::NO_CONTENT.into_response()
}
