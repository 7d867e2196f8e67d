//! Message router (fan-out engine).
//!
//! The router resolves an envelope's target against this instance's registry
//! and room index, delivers to every matching local session, and hands the
//! envelope to the relay so other instances do the same.

use parley_protocol::{ChatMessage, Envelope, Target};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::membership::spawn_best_effort;
use crate::metrics;
use crate::registry::Registry;
use crate::relay::{EnvelopeHandler, Relay};
use crate::room::RoomIndex;
use crate::session::{Delivery, SessionHandle};
use crate::store::MessageStore;

/// Router errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The message failed validation; nothing was stored or delivered.
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),
}

/// Validate a message before routing.
///
/// # Errors
///
/// Returns [`RouterError::InvalidMessage`] for an empty content or sender.
pub fn validate(message: &ChatMessage) -> Result<(), RouterError> {
    if message.content.trim().is_empty() {
        return Err(RouterError::InvalidMessage("Message content cannot be empty"));
    }
    if message.sender.trim().is_empty() {
        return Err(RouterError::InvalidMessage("Message sender cannot be empty"));
    }
    if let Target::Room(room) | Target::Receiver(room) = &message.target {
        if room.is_empty() {
            return Err(RouterError::InvalidMessage("Message target cannot be empty"));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Counters {
    routed: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

/// The fan-out engine for one instance.
pub struct Router {
    registry: Arc<Registry>,
    rooms: Arc<RoomIndex>,
    store: Arc<dyn MessageStore>,
    relay: Arc<Relay>,
    counters: Counters,
}

impl Router {
    /// Create a router over the instance's state.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        rooms: Arc<RoomIndex>,
        store: Arc<dyn MessageStore>,
        relay: Arc<Relay>,
    ) -> Self {
        Self {
            registry,
            rooms,
            store,
            relay,
            counters: Counters::default(),
        }
    }

    /// Route a chat message.
    ///
    /// Returns the number of local sessions the message was delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidMessage`] if validation fails.
    pub fn route(&self, message: ChatMessage) -> Result<usize, RouterError> {
        validate(&message)?;

        let store = Arc::clone(&self.store);
        let stored = message.clone();
        spawn_best_effort(async move {
            if let Err(e) = store.store(&stored).await {
                warn!(message = %stored.id, error = %e, "Message store unavailable; delivering anyway");
                metrics::record_store_failure("message_store");
            }
        });

        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        metrics::record_routed(message.kind.name());
        debug!(
            message = %message.id,
            sender = %message.sender,
            target = message.target.mode(),
            "Routing message"
        );

        let envelope = Envelope::for_message(message, self.relay.instance_id());
        Ok(self.dispatch(envelope))
    }

    /// Deliver locally, then publish for other instances.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        let delivered = self.deliver_local(&envelope);
        self.relay.publish(envelope);
        delivered
    }

    /// Deliver an envelope to the matching sessions of this instance.
    pub fn deliver_local(&self, envelope: &Envelope) -> usize {
        let recipients = self.resolve(&envelope.target);
        let event = Arc::new(envelope.event.clone());
        let mut delivered = 0;

        for handle in recipients {
            if envelope.excludes(handle.id()) {
                continue;
            }
            match handle.deliver(&envelope.id, &event) {
                Delivery::Delivered => delivered += 1,
                Delivery::Duplicate => {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    metrics::record_duplicate();
                }
                Delivery::Dropped => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_drop("full");
                    warn!(
                        session = %handle.id(),
                        event = event.name(),
                        "Outbound channel full; event dropped"
                    );
                }
                Delivery::Closed => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_drop("closed");
                    debug!(session = %handle.id(), "Outbound channel closed; event dropped");
                }
            }
        }

        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        metrics::record_deliveries(event.name(), delivered);
        trace!(
            envelope = %envelope.id,
            target = envelope.target.mode(),
            recipients = delivered,
            "Delivered locally"
        );
        delivered
    }

    fn resolve(&self, target: &Target) -> Vec<Arc<SessionHandle>> {
        match target {
            Target::Room(room) => self
                .rooms
                .sessions_in(room)
                .iter()
                .filter_map(|s| self.registry.handle(s))
                .collect(),
            Target::Receiver(identity) => self
                .registry
                .devices_of(identity)
                .iter()
                .filter_map(|s| self.registry.handle(s))
                .collect(),
            Target::Broadcast => self.registry.handles(),
        }
    }

    /// Router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routed: self.counters.routed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
        }
    }
}

impl EnvelopeHandler for Router {
    fn handle(&self, envelope: Envelope) {
        // Our own envelopes were delivered locally before they were published.
        if envelope.origin == self.relay.instance_id() {
            trace!(envelope = %envelope.id, "Skipping relay echo");
            return;
        }
        self.deliver_local(&envelope);
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Chat messages accepted.
    pub routed: u64,
    /// Local deliveries.
    pub delivered: u64,
    /// Deliveries dropped on full or closed channels.
    pub dropped: u64,
    /// Deliveries suppressed as already seen.
    pub duplicates: u64,
}
