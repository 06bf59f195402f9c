//! Provider registry: an in-process cache over the provider row store.
//!
//! Reads within one request see a single snapshot (`Arc<Vec<Provider>>`
//! taken once). The cache expires by TTL (60 s default) and is cleared
//! eagerly when an invalidation arrives on the bus; if the bus is gone,
//! the TTL still bounds staleness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bus::Bus;
use crate::providers::Provider;
use crate::store::SharedStore;

/// Shared registry type.
pub type SharedRegistry = Arc<ProviderRegistry>;

struct CacheEntry {
    snapshot: Arc<Vec<Provider>>,
    loaded_at: Instant,
}

pub struct ProviderRegistry {
    store: SharedStore,
    ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
}

impl ProviderRegistry {
    pub fn new(store: SharedStore, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            ttl,
            cache: RwLock::new(None),
        })
    }

    /// Spawn the invalidation listener. Clears the cache on every message;
    /// on lag it resubscribes and clears anyway, which is always safe.
    pub fn listen(self: &Arc<Self>, bus: &Bus) {
        let registry = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) => {
                        registry.invalidate().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Invalidation listener lagged; clearing cache");
                        registry.invalidate().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// All providers, as one consistent snapshot.
    pub async fn all(&self) -> anyhow::Result<Arc<Vec<Provider>>> {
        {
            let guard = self.cache.read().await;
            if let Some(entry) = guard.as_ref() {
                if entry.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.snapshot));
                }
            }
        }
        self.reload().await
    }

    /// Look up one provider from the current snapshot.
    pub async fn by_id(&self, id: Uuid) -> anyhow::Result<Option<Provider>> {
        let snapshot = self.all().await?;
        Ok(snapshot.iter().find(|p| p.id == id).cloned())
    }

    /// Bypass the cache and reload from the store.
    pub async fn fresh(&self) -> anyhow::Result<Arc<Vec<Provider>>> {
        self.reload().await
    }

    /// Drop the cached snapshot; the next read reloads.
    pub async fn invalidate(&self) {
        let mut guard = self.cache.write().await;
        *guard = None;
        tracing::debug!("Provider cache invalidated");
    }

    async fn reload(&self) -> anyhow::Result<Arc<Vec<Provider>>> {
        let providers = self.store.list_providers().await?;
        let snapshot = Arc::new(providers);
        let mut guard = self.cache.write().await;
        *guard = Some(CacheEntry {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
        });
        Ok(snapshot)
    }
}
