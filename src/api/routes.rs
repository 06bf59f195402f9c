//! Service wiring: shared state construction, router assembly, and the
//! HTTP server with graceful drain.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::breaker::{CircuitBreaker, SharedBreaker};
use crate::bus::Bus;
use crate::config::Config;
use crate::counters::CounterStore;
use crate::dispatch::HttpDispatcher;
use crate::limiter::{RateLimiter, SharedLimiter};
use crate::pipeline::{Pipeline, SharedPipeline};
use crate::registry::{ProviderRegistry, SharedRegistry};
use crate::selector::ProviderSelector;
use crate::sessions::{SessionTracker, SharedSessions};
use crate::store::{SharedStore, Store};
use crate::upstream_auth::AuthResolver;
use crate::usage::{SharedRecorder, UsageRecorder};

/// Process-wide services, constructed once at startup and shared by every
/// request task.
pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub registry: SharedRegistry,
    pub bus: Bus,
    pub breaker: SharedBreaker,
    pub limiter: SharedLimiter,
    pub sessions: SharedSessions,
    pub recorder: SharedRecorder,
    pub pipeline: SharedPipeline,
}

impl AppState {
    /// Build the full service graph over an opened store.
    pub fn build(config: Config, store: Store) -> Arc<Self> {
        let store: SharedStore = Arc::new(store);
        let bus = Bus::new(config.pubsub_channel.clone());
        let registry = ProviderRegistry::new(
            Arc::clone(&store),
            Duration::from_secs(config.provider_cache_ttl_secs),
        );
        registry.listen(&bus);

        let counters = CounterStore::new();
        let limiter = RateLimiter::new(counters, config.utc_offset_minutes);
        let breaker = CircuitBreaker::new(Arc::clone(&store));
        let sessions = SessionTracker::new();
        let selector = ProviderSelector::new(
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            Arc::clone(&sessions),
        );
        let recorder = UsageRecorder::new(
            Arc::clone(&store),
            Arc::clone(&limiter),
            config.cache_tier_default,
        );
        let http_client = reqwest::Client::new();
        let dispatcher = HttpDispatcher::new(http_client.clone());
        let pipeline = Pipeline::new(
            Arc::clone(&registry),
            selector,
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            Arc::clone(&sessions),
            AuthResolver::new(),
            dispatcher,
            Arc::clone(&recorder),
            http_client,
        );

        Arc::new(Self {
            config,
            store,
            registry,
            bus,
            breaker,
            limiter,
            sessions,
            recorder,
            pipeline,
        })
    }
}

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(super::ingress::routes())
        .nest("/admin", super::admin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining in-flight requests");
}

/// Start the HTTP server. Blocks until shutdown; in-flight requests are
/// drained up to the configured grace deadline, then dropped.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config, store);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Listening");

    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = drained_tx.send(());
    });
    let mut server = std::pin::pin!(server.into_future());

    tokio::select! {
        result = &mut server => {
            result?;
        }
        _ = async {
            // start the drain timer only once the signal has fired
            let _ = drained_rx.await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Drain deadline exceeded, dropping remaining connections"
            );
        }
    }
    tracing::info!("Server stopped");
    Ok(())
}
