//! Sessions and identities.
//!
//! A session is one live connection. Its [`SessionHandle`] is the only way the
//! core talks to the transport: a bounded outbound channel plus the session's
//! recently-seen delivery ids.

use parley_protocol::{IdentityKey, ServerEvent, SessionId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

use crate::dedup::SeenCache;

/// Outbound sink of a session, drained by its connection task.
pub type Outbound = mpsc::Sender<Arc<ServerEvent>>;

/// Profile of an identity, refreshed on every join.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable identity key.
    pub key: IdentityKey,
    /// Display name.
    pub display_name: String,
    /// Avatar reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Arbitrary client metadata.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Identity {
    /// Create an identity whose display name is its key.
    #[must_use]
    pub fn new(key: impl Into<IdentityKey>) -> Self {
        let key = key.into();
        Self {
            display_name: key.clone(),
            key,
            avatar: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the avatar reference.
    #[must_use]
    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of handing an event to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the outbound channel.
    Delivered,
    /// Already delivered within the dedup window.
    Duplicate,
    /// Outbound channel full; the event was dropped.
    Dropped,
    /// Connection task is gone.
    Closed,
}

/// Delivery capability for one session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outbound: Outbound,
    seen: Mutex<SeenCache>,
}

impl SessionHandle {
    /// Create a handle.
    #[must_use]
    pub fn new(id: impl Into<SessionId>, outbound: Outbound, seen: SeenCache) -> Self {
        Self {
            id: id.into(),
            outbound,
            seen: Mutex::new(seen),
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver a routed event at most once per delivery id.
    pub fn deliver(&self, delivery_id: &str, event: &Arc<ServerEvent>) -> Delivery {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(delivery_id) {
                trace!(session = %self.id, delivery = %delivery_id, "Duplicate delivery suppressed");
                return Delivery::Duplicate;
            }
        }
        self.push(Arc::clone(event))
    }

    /// Send an event addressed only to this session, such as a confirmation.
    pub fn send_direct(&self, event: ServerEvent) -> Delivery {
        self.push(Arc::new(event))
    }

    fn push(&self, event: Arc<ServerEvent>) -> Delivery {
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// A joined session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owning identity.
    pub identity: IdentityKey,
    /// Device descriptor.
    pub device: String,
    /// Join time in unix milliseconds.
    pub connected_at: u64,
    pub(crate) handle: Arc<SessionHandle>,
}

impl Session {
    /// The session's delivery handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(capacity: usize) -> (SessionHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let seen = SeenCache::new(Duration::from_secs(60), 16);
        (SessionHandle::new("s-1", tx, seen), rx)
    }

    #[test]
    fn test_deliver_suppresses_duplicates() {
        let (handle, mut rx) = handle(4);
        let event = Arc::new(ServerEvent::error("x"));

        assert_eq!(handle.deliver("m-1", &event), Delivery::Delivered);
        assert_eq!(handle.deliver("m-1", &event), Delivery::Duplicate);
        assert_eq!(handle.deliver("m-2", &event), Delivery::Delivered);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_and_closed_channels() {
        let (handle, rx) = handle(1);
        let event = Arc::new(ServerEvent::error("x"));

        assert_eq!(handle.deliver("m-1", &event), Delivery::Delivered);
        assert_eq!(handle.deliver("m-2", &event), Delivery::Dropped);

        drop(rx);
        assert_eq!(handle.send_direct(ServerEvent::error("y")), Delivery::Closed);
    }

    #[test]
    fn test_identity_builder() {
        let identity = Identity::new("alice").with_avatar("a.png");
        assert_eq!(identity.display_name, "alice");
        assert_eq!(identity.avatar.as_deref(), Some("a.png"));
    }
}
