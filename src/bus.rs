//! Config-invalidation fan-out.
//!
//! Admin mutations publish on a broadcast channel; every registry instance
//! subscribes and clears its cache on receipt. Lagged or missed messages are
//! harmless: cache entries still expire by TTL.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Message published on the invalidation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    /// Provider records changed; drop the provider cache
    ProviderCache,
}

/// The invalidation bus.
#[derive(Debug, Clone)]
pub struct Bus {
    channel: String,
    tx: broadcast::Sender<Invalidation>,
}

impl Bus {
    pub fn new(channel: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            channel: channel.into(),
            tx,
        }
    }

    /// The configured channel name (diagnostic only).
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Broadcast a provider-cache invalidation to all subscribers.
    pub fn publish_provider_invalidation(&self) {
        let receivers = self.tx.receiver_count();
        if self.tx.send(Invalidation::ProviderCache).is_err() {
            tracing::debug!(channel = %self.channel, "No invalidation subscribers");
        } else {
            tracing::debug!(
                channel = %self.channel,
                receivers,
                "Published provider cache invalidation"
            );
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_invalidations() {
        let bus = Bus::new("test-channel");
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish_provider_invalidation();
        assert_eq!(rx1.recv().await.unwrap(), Invalidation::ProviderCache);
        assert_eq!(rx2.recv().await.unwrap(), Invalidation::ProviderCache);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = Bus::new("test-channel");
        bus.publish_provider_invalidation();
    }
}
