//! Presence transitions.
//!
//! Presence is derived purely from registry outcomes: a join or leave maps to
//! exactly one [`PresenceChange`], which becomes one routed envelope.

use parley_protocol::{Envelope, IdentityKey, ServerEvent, SessionId, Status, Target};

use crate::registry::{JoinOutcome, LeaveOutcome};

/// A device-set transition of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// First device connected (0 -> 1).
    CameOnline { identity: IdentityKey },
    /// Another device connected.
    DeviceJoined {
        identity: IdentityKey,
        session_id: SessionId,
        device: String,
        device_count: usize,
    },
    /// A device left; others remain.
    DeviceLeft {
        identity: IdentityKey,
        session_id: SessionId,
        device_count: usize,
    },
    /// Last device left (1 -> 0).
    WentOffline { identity: IdentityKey },
}

impl PresenceChange {
    /// Presence change caused by a successful join.
    #[must_use]
    pub fn from_join(
        identity: &str,
        session_id: &str,
        device: &str,
        outcome: &JoinOutcome,
    ) -> Self {
        if outcome.is_first_device {
            PresenceChange::CameOnline {
                identity: identity.to_string(),
            }
        } else {
            PresenceChange::DeviceJoined {
                identity: identity.to_string(),
                session_id: session_id.to_string(),
                device: device.to_string(),
                device_count: outcome.device_count,
            }
        }
    }

    /// Presence change caused by a successful leave.
    #[must_use]
    pub fn from_leave(session_id: &str, outcome: &LeaveOutcome) -> Self {
        if outcome.remaining_device_count == 0 {
            PresenceChange::WentOffline {
                identity: outcome.identity.clone(),
            }
        } else {
            PresenceChange::DeviceLeft {
                identity: outcome.identity.clone(),
                session_id: session_id.to_string(),
                device_count: outcome.remaining_device_count,
            }
        }
    }

    /// The routed form of this change.
    ///
    /// Status changes go to everyone; device changes go to the identity's
    /// other devices.
    #[must_use]
    pub fn into_envelope(self, id: impl Into<String>, origin: impl Into<String>) -> Envelope {
        match self {
            PresenceChange::CameOnline { identity } => Envelope::new(
                id,
                origin,
                Target::Broadcast,
                ServerEvent::UserStatus {
                    user_name: identity,
                    status: Status::Online,
                },
            ),
            PresenceChange::WentOffline { identity } => Envelope::new(
                id,
                origin,
                Target::Broadcast,
                ServerEvent::UserStatus {
                    user_name: identity,
                    status: Status::Offline,
                },
            ),
            PresenceChange::DeviceJoined {
                identity,
                session_id,
                device,
                device_count,
            } => Envelope::new(
                id,
                origin,
                Target::Receiver(identity),
                ServerEvent::DeviceConnected {
                    device_info: device,
                    session_id: session_id.clone(),
                    device_count,
                },
            )
            .excluding(session_id),
            PresenceChange::DeviceLeft {
                identity,
                session_id,
                device_count,
            } => Envelope::new(
                id,
                origin,
                Target::Receiver(identity),
                ServerEvent::DeviceDisconnected {
                    session_id,
                    device_count,
                },
            ),
        }
    }
}
