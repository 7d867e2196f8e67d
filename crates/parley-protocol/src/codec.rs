//! Codecs for relay envelopes and client event frames.
//!
//! Envelopes on the bus are named-field MessagePack. Client frames are JSON text.

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::events::{ClientEvent, ServerEvent};
use crate::version::{Version, PROTOCOL_VERSION};

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// Envelope was produced by an incompatible protocol version.
    #[error("Incompatible protocol version {0} (local {PROTOCOL_VERSION})")]
    IncompatibleVersion(Version),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON frame error.
    #[error("Invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Only the version, so incompatible envelopes are rejected before a full decode.
#[derive(Deserialize)]
struct VersionHeader {
    version: Version,
}

/// Encode an envelope for the bus.
///
/// # Errors
///
/// Returns an error if encoding fails or the envelope is too large.
pub fn encode_envelope(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope received from the bus.
///
/// # Errors
///
/// Returns an error if the data is too large, malformed, or from an
/// incompatible protocol version.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }

    let header: VersionHeader = rmp_serde::from_slice(data)?;
    if !PROTOCOL_VERSION.is_compatible_with(&header.version) {
        return Err(ProtocolError::IncompatibleVersion(header.version));
    }

    Ok(rmp_serde::from_slice(data)?)
}

/// Encode a server event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_event(event: &ServerEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a JSON text frame sent by a client.
///
/// # Errors
///
/// Returns an error if the frame is not a known client event.
pub fn decode_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Attachment, ChatMessage, MessageKind, Target};

    #[test]
    fn test_envelope_survives_bus_encoding() {
        let msg = ChatMessage::text("m-1", "alice", "report attached")
            .to_receiver("bob")
            .with_kind(MessageKind::File(Attachment {
                name: "report.pdf".into(),
                size: 1234,
                url: "/uploads/report.pdf".into(),
                mime_type: "application/pdf".into(),
            }));
        let envelope = Envelope::for_message(msg, "instance-a").excluding("s-9");

        let encoded = encode_envelope(&envelope).unwrap();
        let decoded = decode_envelope(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut envelope = Envelope::new(
            "e-1",
            "instance-a",
            Target::Broadcast,
            ServerEvent::error("boom"),
        );
        envelope.version = Version::new(PROTOCOL_VERSION.major + 1, 0);

        let encoded = encode_envelope(&envelope).unwrap();
        match decode_envelope(&encoded) {
            Err(ProtocolError::IncompatibleVersion(v)) => assert_eq!(v, envelope.version),
            other => panic!("Expected IncompatibleVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            decode_envelope(b"\xc1\xc1\xc1"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_oversized_input_rejected() {
        let data = vec![0u8; MAX_ENVELOPE_SIZE + 1];
        assert!(matches!(
            decode_envelope(&data),
            Err(ProtocolError::EnvelopeTooLarge(_))
        ));
    }

    #[test]
    fn test_unknown_client_event_rejected() {
        assert!(decode_client_event(r#"{"event":"shout","data":{}}"#).is_err());
        assert!(decode_client_event("not json").is_err());
    }
}
