//! Chat message model.
//!
//! A [`ChatMessage`] is an immutable value shared by the client protocol, the
//! relay envelope and the durable message store.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = String;

/// Opaque stable user key chosen by the client at join time.
pub type IdentityKey = String;

/// Room identifier.
pub type RoomId = String;

/// Transport-assigned connection identifier.
pub type SessionId = String;

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Descriptor of an already-uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Original file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Where clients can download the file.
    pub url: String,
    /// MIME type reported by the uploader.
    pub mime_type: String,
}

/// Message kind with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "metadata", rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Generic file attachment.
    File(Attachment),
    /// Image attachment.
    Image(Attachment),
    /// Server-generated notice with free-form detail.
    System(String),
}

impl MessageKind {
    /// Short kind name, as used on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File(_) => "file",
            MessageKind::Image(_) => "image",
            MessageKind::System(_) => "system",
        }
    }

    /// The attachment carried by file and image messages.
    #[must_use]
    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            MessageKind::File(a) | MessageKind::Image(a) => Some(a),
            MessageKind::Text | MessageKind::System(_) => None,
        }
    }
}

/// Delivery target. A message has exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "to", rename_all = "lowercase")]
pub enum Target {
    /// Every session socket-joined to the room.
    Room(RoomId),
    /// Every device of one identity.
    Receiver(IdentityKey),
    /// Every connected session.
    Broadcast,
}

impl Target {
    /// Build a target from the optional room and receiver of a client payload.
    ///
    /// Empty strings count as unset.
    ///
    /// # Errors
    ///
    /// Returns an error if both a room and a receiver are given.
    pub fn from_parts(
        room: Option<String>,
        receiver: Option<String>,
    ) -> Result<Self, &'static str> {
        let room = room.filter(|r| !r.is_empty());
        let receiver = receiver.filter(|r| !r.is_empty());
        match (room, receiver) {
            (Some(_), Some(_)) => Err("Message cannot target both a room and a receiver"),
            (Some(room), None) => Ok(Target::Room(room)),
            (None, Some(receiver)) => Ok(Target::Receiver(receiver)),
            (None, None) => Ok(Target::Broadcast),
        }
    }

    /// Mode name for logging.
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Target::Room(_) => "room",
            Target::Receiver(_) => "receiver",
            Target::Broadcast => "broadcast",
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique message identifier.
    pub id: MessageId,
    /// Kind and kind-specific payload.
    pub kind: MessageKind,
    /// Message body.
    pub content: String,
    /// Sender identity as asserted by the client.
    pub sender: IdentityKey,
    /// Delivery target.
    pub target: Target,
    /// Creation time in unix milliseconds.
    pub timestamp: u64,
}

impl ChatMessage {
    /// Create a broadcast text message stamped with the current time.
    #[must_use]
    pub fn text(
        id: impl Into<MessageId>,
        sender: impl Into<IdentityKey>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: MessageKind::Text,
            content: content.into(),
            sender: sender.into(),
            target: Target::Broadcast,
            timestamp: now_millis(),
        }
    }

    /// Retarget the message at a room.
    #[must_use]
    pub fn to_room(mut self, room: impl Into<RoomId>) -> Self {
        self.target = Target::Room(room.into());
        self
    }

    /// Retarget the message at one identity's devices.
    #[must_use]
    pub fn to_receiver(mut self, receiver: impl Into<IdentityKey>) -> Self {
        self.target = Target::Receiver(receiver.into());
        self
    }

    /// Replace the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// The room, if room-targeted.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        match &self.target {
            Target::Room(room) => Some(room),
            _ => None,
        }
    }

    /// The receiver, if receiver-targeted.
    #[must_use]
    pub fn receiver(&self) -> Option<&str> {
        match &self.target {
            Target::Receiver(receiver) => Some(receiver),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_parts() {
        assert_eq!(
            Target::from_parts(Some("general".into()), None),
            Ok(Target::Room("general".into()))
        );
        assert_eq!(
            Target::from_parts(None, Some("bob".into())),
            Ok(Target::Receiver("bob".into()))
        );
        assert_eq!(
            Target::from_parts(Some(String::new()), Some(String::new())),
            Ok(Target::Broadcast)
        );
        assert!(Target::from_parts(Some("general".into()), Some("bob".into())).is_err());
    }

    #[test]
    fn test_message_builder() {
        let msg = ChatMessage::text("m-1", "alice", "hi").to_room("general");
        assert_eq!(msg.room(), Some("general"));
        assert_eq!(msg.receiver(), None);
        assert_eq!(msg.kind.name(), "text");

        let msg = msg.to_receiver("bob");
        assert_eq!(msg.room(), None);
        assert_eq!(msg.receiver(), Some("bob"));
    }

    #[test]
    fn test_kind_json_shape() {
        let kind = MessageKind::Image(Attachment {
            name: "cat.png".into(),
            size: 2048,
            url: "/uploads/cat.png".into(),
            mime_type: "image/png".into(),
        });
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["metadata"]["mimeType"], "image/png");

        let text = serde_json::to_value(MessageKind::Text).unwrap();
        assert_eq!(text, serde_json::json!({"type": "text"}));
    }
}
