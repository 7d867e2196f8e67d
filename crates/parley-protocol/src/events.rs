//! Client and server event frames.
//!
//! Events travel as JSON text frames of the form
//! `{"event": "<name>", "data": {...}}` with camelCase field names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::message::{Attachment, ChatMessage, MessageKind, SessionId, Target};

/// Device descriptor used when the client does not send one.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Payload of a `join` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    /// Identity key; also the default display name.
    #[serde(default)]
    pub user_name: String,
    /// Free-form device descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    /// Avatar reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Display name, if different from the identity key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Arbitrary client metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Payload of room-scoped client events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    /// Target room.
    #[serde(default)]
    pub room_id: String,
}

/// Message kind as named by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindName {
    #[default]
    Text,
    File,
    Image,
    System,
}

/// Payload of a `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Message kind.
    #[serde(rename = "type", default)]
    pub kind: KindName,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Sender identity.
    #[serde(default)]
    pub sender: String,
    /// Room target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Direct receiver target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Attachment for file and image messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Detail text for system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SendMessage {
    /// Turn the client payload into a message with the given id and timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the target is ambiguous or an attachment is missing.
    pub fn into_message(self, id: String, timestamp: u64) -> Result<ChatMessage, &'static str> {
        let kind = match self.kind {
            KindName::Text => MessageKind::Text,
            KindName::File => MessageKind::File(
                self.attachment
                    .ok_or("File messages require an attachment")?,
            ),
            KindName::Image => MessageKind::Image(
                self.attachment
                    .ok_or("Image messages require an attachment")?,
            ),
            KindName::System => MessageKind::System(self.detail.unwrap_or_default()),
        };
        let target = Target::from_parts(self.room_id, self.receiver)?;

        Ok(ChatMessage {
            id,
            kind,
            content: self.content,
            sender: self.sender,
            target,
            timestamp,
        })
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join(JoinPayload),
    JoinRoom(RoomPayload),
    LeaveRoom(RoomPayload),
    Message(SendMessage),
    Typing(RoomPayload),
    StopTyping(RoomPayload),
}

impl ClientEvent {
    /// Event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join(_) => "join",
            ClientEvent::JoinRoom(_) => "join_room",
            ClientEvent::LeaveRoom(_) => "leave_room",
            ClientEvent::Message(_) => "message",
            ClientEvent::Typing(_) => "typing",
            ClientEvent::StopTyping(_) => "stop_typing",
        }
    }
}

/// Online status of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Online,
    Offline,
}

/// Confirmation sent to a session after a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub user_id: String,
    pub user_name: String,
    pub device_info: String,
    pub status: Status,
    pub device_count: usize,
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined(Joined),

    #[serde(rename_all = "camelCase")]
    DeviceConnected {
        device_info: String,
        session_id: SessionId,
        device_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    DeviceDisconnected {
        session_id: SessionId,
        device_count: usize,
    },

    #[serde(rename_all = "camelCase")]
    UserStatus { user_name: String, status: Status },

    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: String, user_name: String },

    #[serde(rename_all = "camelCase")]
    UserJoinedRoom { user_name: String, room_id: String },

    #[serde(rename_all = "camelCase")]
    UserLeftRoom { user_name: String, room_id: String },

    Message(ChatMessage),

    #[serde(rename_all = "camelCase")]
    Typing { user_name: String, room_id: String },

    #[serde(rename_all = "camelCase")]
    StopTyping { user_name: String, room_id: String },

    Error { message: String },
}

impl ServerEvent {
    /// Event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined(_) => "joined",
            ServerEvent::DeviceConnected { .. } => "device_connected",
            ServerEvent::DeviceDisconnected { .. } => "device_disconnected",
            ServerEvent::UserStatus { .. } => "user_status",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::RoomLeft { .. } => "room_left",
            ServerEvent::UserJoinedRoom { .. } => "user_joined_room",
            ServerEvent::UserLeftRoom { .. } => "user_left_room",
            ServerEvent::Message(_) => "message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::StopTyping { .. } => "stop_typing",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}
