//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat relay.
//!
//! This crate defines the data that crosses process boundaries:
//!
//! - `ChatMessage` - the chat message model shared by clients, the bus and the store
//! - `ClientEvent` / `ServerEvent` - JSON event frames exchanged with clients
//! - `Envelope` - the MessagePack unit published between server instances
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ChatMessage, Envelope};
//!
//! let message = ChatMessage::text("m-1", "alice", "hello").to_room("general");
//! let envelope = Envelope::for_message(message, "instance-a");
//!
//! let encoded = codec::encode_envelope(&envelope).unwrap();
//! let decoded = codec::decode_envelope(&encoded).unwrap();
//! assert_eq!(decoded.id, "m-1");
//! ```

pub mod codec;
pub mod envelope;
pub mod events;
pub mod message;
pub mod version;

pub use codec::{decode_envelope, encode_envelope, ProtocolError};
pub use envelope::Envelope;
pub use events::{ClientEvent, Joined, JoinPayload, RoomPayload, SendMessage, ServerEvent, Status};
pub use message::{
    now_millis, Attachment, ChatMessage, IdentityKey, MessageId, MessageKind, RoomId, SessionId,
    Target,
};
pub use version::{Version, PROTOCOL_VERSION};
