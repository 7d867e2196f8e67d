//! Publish/subscribe bus shared by all instances.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Bus errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus could not be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// A channel-oriented pub/sub bus.
///
/// A subscription stream ends when the bus connection is lost; callers
/// resubscribe.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BusError>;
}

/// Default per-channel buffer of [`MemoryBus`].
const DEFAULT_BUS_CAPACITY: usize = 4096;

/// In-process bus. Clones of an `Arc<MemoryBus>` let several hubs in one
/// process act as separate instances.
pub struct MemoryBus {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    online: AtomicBool,
    capacity: usize,
}

impl MemoryBus {
    /// Create an online bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create an online bus buffering `capacity` payloads per channel.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            online: AtomicBool::new(true),
            capacity: capacity.max(1),
        }
    }

    /// Simulate an outage or recovery. Going offline ends every subscription.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.channels.clear();
        }
        debug!(online, "Memory bus state changed");
    }

    /// Whether the bus accepts traffic.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Live subscribers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(BusError::Unavailable("memory bus offline".into()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        self.check_online()?;
        if let Some(tx) = self.channels.get(channel) {
            // no subscribers is not an error
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BusError> {
        self.check_online()?;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Memory bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("messages").await.unwrap();
        let mut b = bus.subscribe("messages").await.unwrap();
        assert_eq!(bus.subscriber_count("messages"), 2);

        bus.publish("messages", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        assert!(bus.publish("messages", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_outage_ends_streams_and_rejects_traffic() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("messages").await.unwrap();

        bus.set_online(false);
        assert!(sub.next().await.is_none());
        assert!(bus.publish("messages", Bytes::new()).await.is_err());
        assert!(bus.subscribe("messages").await.is_err());

        bus.set_online(true);
        assert!(bus.subscribe("messages").await.is_ok());
    }
}
