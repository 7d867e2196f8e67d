//! Relay envelopes.
//!
//! An envelope is what one instance publishes on the shared bus. It carries
//! the target and the event itself, so a receiving instance resolves its own
//! local recipients without consulting any durable store.

use serde::{Deserialize, Serialize};

use crate::events::ServerEvent;
use crate::message::{ChatMessage, SessionId, Target};
use crate::version::{Version, PROTOCOL_VERSION};

/// The wire form of a routed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Version of the producing instance.
    pub version: Version,
    /// Delivery id; recipients deduplicate on it.
    pub id: String,
    /// Instance that published the envelope.
    pub origin: String,
    /// Where the event goes.
    pub target: Target,
    /// Session that must not receive the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<SessionId>,
    /// The event to deliver.
    pub event: ServerEvent,
}

impl Envelope {
    /// Create an envelope stamped with the current protocol version.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        origin: impl Into<String>,
        target: Target,
        event: ServerEvent,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: id.into(),
            origin: origin.into(),
            target,
            exclude: None,
            event,
        }
    }

    /// Wrap a chat message. The envelope id is the message id.
    #[must_use]
    pub fn for_message(message: ChatMessage, origin: impl Into<String>) -> Self {
        let id = message.id.clone();
        let target = message.target.clone();
        Self::new(id, origin, target, ServerEvent::Message(message))
    }

    /// Skip one session when delivering.
    #[must_use]
    pub fn excluding(mut self, session_id: impl Into<SessionId>) -> Self {
        self.exclude = Some(session_id.into());
        self
    }

    /// Whether the given session is excluded from delivery.
    #[must_use]
    pub fn excludes(&self, session_id: &str) -> bool {
        self.exclude.as_deref() == Some(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope_reuses_message_id_and_target() {
        let msg = ChatMessage::text("m-42", "alice", "hi").to_room("general");
        let envelope = Envelope::for_message(msg, "instance-a");

        assert_eq!(envelope.id, "m-42");
        assert_eq!(envelope.target, Target::Room("general".into()));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert!(envelope.exclude.is_none());
    }

    #[test]
    fn test_excluding() {
        let envelope = Envelope::new(
            "e-1",
            "instance-a",
            Target::Receiver("alice".into()),
            ServerEvent::error("x"),
        )
        .excluding("s-1");

        assert!(envelope.excludes("s-1"));
        assert!(!envelope.excludes("s-2"));
    }
}
