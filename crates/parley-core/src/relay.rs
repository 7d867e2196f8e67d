//! Cross-instance relay.
//!
//! Every instance publishes the envelopes it routes on one bus channel and
//! subscribes to that same channel, re-delivering each envelope to its own
//! local sessions. Publishing never blocks the caller: envelopes are queued on a
//! bounded channel for a dedicated publisher task, and dropped when it is full.
//! A standing subscriber task keeps the
//! subscription alive, retrying forever with exponential backoff.

use futures_util::StreamExt;
use parley_protocol::{decode_envelope, encode_envelope, Envelope, ProtocolError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusError, PubSub};
use crate::metrics;

/// Default bus channel.
pub const DEFAULT_CHANNEL: &str = "messages";

/// Default publish queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;

/// Default timeout for one bus publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The bus is unreachable.
    #[error("Relay unavailable: {0}")]
    Unavailable(#[from] BusError),

    /// A payload could not be encoded or decoded.
    #[error("Relay protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The bus did not accept a publish in time.
    #[error("Relay publish timed out after {0:?}")]
    Timeout(Duration),

    /// `start` was called twice.
    #[error("Relay already started")]
    AlreadyStarted,
}

/// Receives envelopes arriving from the bus.
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Deliver an envelope to local sessions.
    fn handle(&self, envelope: Envelope);
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bus channel carrying envelopes.
    pub channel: String,
    /// First reconnect delay.
    pub initial_backoff: Duration,
    /// Reconnect delay ceiling.
    pub max_backoff: Duration,
    /// Envelopes waiting for the publisher before new ones are dropped.
    pub queue_capacity: usize,
    /// Longest a single bus publish may take.
    pub publish_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Doubling delay between `initial` and `max`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    decode_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub published: u64,
    pub publish_failures: u64,
    /// Envelopes dropped because the publish queue was full.
    pub dropped: u64,
    pub received: u64,
    pub decode_failures: u64,
    pub reconnects: u64,
    pub connected: bool,
}

/// The relay for one instance.
pub struct Relay {
    instance_id: String,
    bus: Arc<dyn PubSub>,
    config: RelayConfig,
    publish_tx: mpsc::Sender<Envelope>,
    publish_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
    counters: Counters,
}

impl Relay {
    /// Create a relay. Nothing runs until [`Relay::start`].
    #[must_use]
    pub fn new(instance_id: impl Into<String>, bus: Arc<dyn PubSub>, config: RelayConfig) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            instance_id: instance_id.into(),
            bus,
            config,
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            connected: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Spawn the publisher and subscriber tasks. Must be called within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::AlreadyStarted`] on a second call.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn EnvelopeHandler>) -> Result<(), RelayError> {
        let rx = self
            .publish_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(RelayError::AlreadyStarted)?;

        info!(
            instance = %self.instance_id,
            channel = %self.config.channel,
            "Starting relay"
        );
        tokio::spawn(Arc::clone(self).run_publisher(rx));
        tokio::spawn(Arc::clone(self).run_subscriber(handler));
        Ok(())
    }

    /// Queue an envelope for publication. Never blocks; a full queue drops it.
    pub fn publish(&self, envelope: Envelope) {
        match self.publish_tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_relay_dropped();
                warn!(
                    instance = %self.instance_id,
                    envelope = %envelope.id,
                    capacity = self.config.queue_capacity,
                    "Relay publish queue full; dropping envelope"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(instance = %self.instance_id, "Relay publisher gone; dropping envelope");
            }
        }
    }

    /// Stop both tasks.
    pub fn shutdown(&self) {
        info!(instance = %self.instance_id, "Shutting down relay");
        self.shutdown.cancel();
    }

    /// Whether the subscription is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Id stamped as `origin` on published envelopes.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Relay statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            published: self.counters.published.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            connected: self.is_connected(),
        }
    }

    async fn run_publisher(self: Arc<Self>, mut rx: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                () = self.shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            if let Err(e) = self.publish_now(&envelope).await {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_relay_publish_failure();
                warn!(
                    envelope = %envelope.id,
                    event = envelope.event.name(),
                    error = %e,
                    "Relay publish failed; envelope dropped"
                );
            }
        }
        debug!(instance = %self.instance_id, "Relay publisher stopped");
    }

    async fn publish_now(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let payload = encode_envelope(envelope)?;
        let timeout = self.config.publish_timeout;
        tokio::time::timeout(timeout, self.bus.publish(&self.config.channel, payload))
            .await
            .map_err(|_| RelayError::Timeout(timeout))??;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::record_relay_published();
        trace!(envelope = %envelope.id, "Envelope published");
        Ok(())
    }

    async fn run_subscriber(self: Arc<Self>, handler: Arc<dyn EnvelopeHandler>) {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let subscription = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = self.bus.subscribe(&self.config.channel) => result,
            };

            match subscription {
                Ok(mut stream) => {
                    backoff.reset();
                    self.connected.store(true, Ordering::SeqCst);
                    info!(channel = %self.config.channel, "Relay subscribed");

                    loop {
                        tokio::select! {
                            () = self.shutdown.cancelled() => {
                                self.connected.store(false, Ordering::SeqCst);
                                return;
                            }
                            next = stream.next() => match next {
                                Some(payload) => self.receive(&payload, handler.as_ref()),
                                None => break,
                            },
                        }
                    }

                    self.connected.store(false, Ordering::SeqCst);
                    warn!(channel = %self.config.channel, "Relay subscription ended");
                }
                Err(e) => {
                    warn!(channel = %self.config.channel, error = %e, "Relay subscribe failed");
                }
            }

            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            metrics::record_relay_reconnect();
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Relay reconnecting");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!(instance = %self.instance_id, "Relay subscriber stopped");
    }

    fn receive(&self, payload: &[u8], handler: &dyn EnvelopeHandler) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        match decode_envelope(payload) {
            Ok(envelope) => {
                trace!(
                    envelope = %envelope.id,
                    origin = %envelope.origin,
                    "Envelope received"
                );
                handler.handle(envelope);
            }
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_relay_decode_failure();
                warn!(bytes = payload.len(), error = %e, "Skipping undecodable relay payload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use bytes::Bytes;
    use parley_protocol::{ServerEvent, Target};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Envelope>>);

    impl EnvelopeHandler for Recorder {
        fn handle(&self, envelope: Envelope) {
            self.0.lock().unwrap().push(envelope);
        }
    }

    impl Recorder {
        fn ids(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|e| e.id.clone()).collect()
        }
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn envelope(id: &str) -> Envelope {
        Envelope::new(id, "a", Target::Broadcast, ServerEvent::error("x"))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_two_relays_see_each_others_envelopes() {
        let bus = Arc::new(MemoryBus::new());
        let a = Arc::new(Relay::new("a", bus.clone(), fast_config()));
        let b = Arc::new(Relay::new("b", bus.clone(), fast_config()));
        let seen_a = Arc::new(Recorder::default());
        let seen_b = Arc::new(Recorder::default());
        a.start(seen_a.clone()).unwrap();
        b.start(seen_b.clone()).unwrap();
        wait_until(|| a.is_connected() && b.is_connected()).await;

        a.publish(envelope("e-1"));
        wait_until(|| seen_b.ids() == vec!["e-1"]).await;
        // the publisher sees its own envelope too
        wait_until(|| seen_a.ids() == vec!["e-1"]).await;
        assert_eq!(a.stats().published, 1);

        a.shutdown();
        b.shutdown();
    }

    /// A bus that accepts subscriptions but never completes a publish.
    struct StalledBus;

    #[async_trait::async_trait]
    impl PubSub for StalledBus {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BusError> {
            std::future::pending().await
        }

        async fn subscribe(
            &self,
            _channel: &str,
        ) -> Result<futures_util::stream::BoxStream<'static, Bytes>, BusError> {
            Ok(futures_util::stream::pending().boxed())
        }
    }

    #[test]
    fn test_unstarted_relay_queue_is_bounded() {
        let config = RelayConfig {
            queue_capacity: 4,
            ..fast_config()
        };
        let relay = Relay::new("a", Arc::new(MemoryBus::new()), config);
        for i in 0..10 {
            relay.publish(envelope(&format!("e-{i}")));
        }
        assert_eq!(relay.stats().dropped, 6);
    }

    #[tokio::test]
    async fn test_stalled_bus_times_out_and_drops_overflow() {
        let config = RelayConfig {
            queue_capacity: 2,
            publish_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let relay = Arc::new(Relay::new("a", Arc::new(StalledBus), config));
        relay.start(Arc::new(Recorder::default())).unwrap();

        // the publisher task has not run yet, so only two fit
        for i in 0..5 {
            relay.publish(envelope(&format!("e-{i}")));
        }
        assert_eq!(relay.stats().dropped, 3);

        wait_until(|| relay.stats().publish_failures == 2).await;
        assert_eq!(relay.stats().published, 0);

        // the queue drained, so it accepts again
        relay.publish(envelope("e-5"));
        assert_eq!(relay.stats().dropped, 3);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let relay = Arc::new(Relay::new("a", Arc::new(MemoryBus::new()), fast_config()));
        relay.start(Arc::new(Recorder::default())).unwrap();
        assert!(matches!(
            relay.start(Arc::new(Recorder::default())),
            Err(RelayError::AlreadyStarted)
        ));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_garbage_payload_is_skipped() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(Relay::new("a", bus.clone(), fast_config()));
        let seen = Arc::new(Recorder::default());
        relay.start(seen.clone()).unwrap();
        wait_until(|| relay.is_connected()).await;

        bus.publish(DEFAULT_CHANNEL, Bytes::from_static(b"\xc1garbage"))
            .await
            .unwrap();
        relay.publish(envelope("e-2"));

        wait_until(|| seen.ids() == vec!["e-2"]).await;
        assert_eq!(relay.stats().decode_failures, 1);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_resubscribes_after_outage() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(Relay::new("a", bus.clone(), fast_config()));
        let seen = Arc::new(Recorder::default());
        relay.start(seen.clone()).unwrap();
        wait_until(|| relay.is_connected()).await;

        bus.set_online(false);
        wait_until(|| !relay.is_connected()).await;

        // published during the outage: dropped, not fatal
        relay.publish(envelope("lost"));
        wait_until(|| relay.stats().publish_failures == 1).await;

        bus.set_online(true);
        wait_until(|| relay.is_connected()).await;
        assert!(relay.stats().reconnects >= 1);

        relay.publish(envelope("e-3"));
        wait_until(|| seen.ids() == vec!["e-3"]).await;
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_subscriber() {
        let bus = Arc::new(MemoryBus::new());
        let relay = Arc::new(Relay::new("a", bus.clone(), fast_config()));
        relay.start(Arc::new(Recorder::default())).unwrap();
        wait_until(|| relay.is_connected()).await;

        relay.shutdown();
        wait_until(|| !relay.is_connected()).await;
        wait_until(|| bus.subscriber_count(DEFAULT_CHANNEL) == 0).await;
    }
}
