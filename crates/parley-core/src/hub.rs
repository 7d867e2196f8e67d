//! Connection lifecycle glue.
//!
//! The [`Hub`] turns transport events into registry, room index and router
//! calls. One hub exists per server instance; instances find each other only
//! through the bus handed to [`Hub::new`].

use parley_protocol::{
    events::UNKNOWN_DEVICE, now_millis, ChatMessage, Envelope, IdentityKey, JoinPayload,
    Joined, SendMessage, ServerEvent, SessionId, Status, Target,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::PubSub;
use crate::dedup::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
use crate::membership::{spawn_best_effort, MembershipTracker};
use crate::metrics;
use crate::presence::PresenceChange;
use crate::registry::{JoinOutcome, LeaveOutcome, OnlineEntry, Registry, RegistryError};
use crate::relay::{EnvelopeHandler, Relay, RelayConfig, RelayError, RelayStats};
use crate::room::{validate_room_id, RoomError, RoomIndex, RoomStats, DEFAULT_MAX_ROOMS_PER_SESSION};
use crate::router::{Router, RouterError, RouterStats};
use crate::session::{Identity, Outbound};
use crate::store::{MembershipStore, MemorySessionStore, MessageStore, SessionStore, StoreError};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Session join or lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Room join or leave failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A message was rejected.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// A store query failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The relay could not be started.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Id of this instance; stamped on every envelope it publishes.
    pub instance_id: String,
    /// Rooms a single session may be in.
    pub max_rooms_per_session: usize,
    /// How long a session remembers delivered ids.
    pub seen_ttl: Duration,
    /// How many delivered ids a session remembers.
    pub seen_capacity: usize,
    /// Relay settings.
    pub relay: RelayConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            max_rooms_per_session: DEFAULT_MAX_ROOMS_PER_SESSION,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            relay: RelayConfig::default(),
        }
    }
}

/// Snapshot of hub state.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    pub sessions: usize,
    pub identities: usize,
    pub rooms: RoomStats,
    pub router: RouterStats,
    pub relay: RelayStats,
}

/// Per-instance entry point of the core.
pub struct Hub {
    registry: Arc<Registry>,
    rooms: Arc<RoomIndex>,
    router: Arc<Router>,
    relay: Arc<Relay>,
    messages: Arc<dyn MessageStore>,
    membership: MembershipTracker,
    sessions: Arc<dyn SessionStore>,
}

fn new_envelope_id() -> String {
    Uuid::new_v4().to_string()
}

impl Hub {
    /// Wire a hub to its stores and bus. Call [`Hub::start`] before use.
    #[must_use]
    pub fn new(
        config: HubConfig,
        message_store: Arc<dyn MessageStore>,
        membership_store: Arc<dyn MembershipStore>,
        bus: Arc<dyn PubSub>,
    ) -> Self {
        info!(instance = %config.instance_id, "Creating hub");
        let registry = Arc::new(Registry::with_dedup(config.seen_ttl, config.seen_capacity));
        let rooms = Arc::new(RoomIndex::with_limit(config.max_rooms_per_session));
        let relay = Arc::new(Relay::new(config.instance_id, bus, config.relay));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&message_store),
            Arc::clone(&relay),
        ));

        Self {
            registry,
            rooms,
            router,
            relay,
            messages: message_store,
            membership: MembershipTracker::new(membership_store),
            sessions: Arc::new(MemorySessionStore::new()),
        }
    }

    /// Cache each identity's latest session in `store` instead of memory.
    #[must_use]
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = store;
        self
    }

    /// Start the relay tasks.
    ///
    /// # Errors
    ///
    /// Fails if the hub was already started.
    pub fn start(&self) -> Result<(), HubError> {
        let handler: Arc<dyn EnvelopeHandler> = self.router.clone();
        self.relay.start(handler)?;
        Ok(())
    }

    /// Stop the relay tasks.
    pub fn shutdown(&self) {
        self.relay.shutdown();
    }

    /// Join a session to an identity.
    ///
    /// Sends `joined` to the session, then routes the presence change.
    ///
    /// # Errors
    ///
    /// Fails for an empty user name or a session that already joined.
    pub fn join(
        &self,
        session_id: &str,
        payload: JoinPayload,
        outbound: Outbound,
    ) -> Result<JoinOutcome, HubError> {
        let key = payload.user_name.trim().to_string();
        let device = payload
            .device_info
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_string());

        let mut identity = Identity::new(key.clone()).with_metadata(payload.metadata);
        if let Some(name) = payload.display_name.filter(|n| !n.is_empty()) {
            identity = identity.with_display_name(name);
        }
        if let Some(avatar) = payload.avatar {
            identity = identity.with_avatar(avatar);
        }

        let greeting = |outcome: JoinOutcome| {
            Some(ServerEvent::Joined(Joined {
                user_id: key.clone(),
                user_name: key.clone(),
                device_info: device.clone(),
                status: Status::Online,
                device_count: outcome.device_count,
            }))
        };
        let outcome =
            self.registry
                .join_greeted(session_id, identity, device.clone(), outbound, greeting)?;
        self.cache_session(&key, session_id);

        let change = PresenceChange::from_join(&key, session_id, &device, &outcome);
        self.router
            .dispatch(change.into_envelope(new_envelope_id(), self.instance_id()));
        metrics::set_joined_sessions(self.registry.len());

        info!(
            session = %session_id,
            identity = %key,
            device = %device,
            devices = outcome.device_count,
            "User joined with device"
        );
        Ok(outcome)
    }

    /// Socket-join a room and record durable membership.
    ///
    /// Returns the `room_joined` confirmation for the session.
    ///
    /// # Errors
    ///
    /// Fails if the session never joined, the room id is invalid or the
    /// session's room limit is reached.
    pub fn join_room(&self, session_id: &str, room: &str) -> Result<ServerEvent, HubError> {
        let identity = self.registry.identity_of(session_id)?;
        let newly_joined = self.rooms.join(session_id, room)?;

        if newly_joined {
            self.membership.record_join(room, &identity);
            self.router.dispatch(Envelope::new(
                new_envelope_id(),
                self.instance_id(),
                Target::Room(room.to_string()),
                ServerEvent::UserJoinedRoom {
                    user_name: identity.clone(),
                    room_id: room.to_string(),
                },
            ));
            metrics::set_active_rooms(self.rooms.stats().room_count);
            info!(session = %session_id, identity = %identity, room = %room, "User joined room");
        } else {
            debug!(session = %session_id, room = %room, "Already in room");
        }

        Ok(ServerEvent::RoomJoined {
            room_id: room.to_string(),
            user_name: identity,
        })
    }

    /// Leave a room, both socket-level and durably.
    ///
    /// A session that is not socket-joined still drops its durable membership,
    /// so a reconnected client can leave a room it joined earlier.
    ///
    /// # Errors
    ///
    /// Fails if the session never joined or the room id is invalid.
    pub fn leave_room(&self, session_id: &str, room: &str) -> Result<ServerEvent, HubError> {
        let identity = self.registry.identity_of(session_id)?;
        validate_room_id(room).map_err(RoomError::InvalidRoom)?;

        match self.rooms.leave(session_id, room) {
            Ok(()) | Err(RoomError::NotJoined(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.membership.record_leave(room, &identity);
        self.router.dispatch(Envelope::new(
            new_envelope_id(),
            self.instance_id(),
            Target::Room(room.to_string()),
            ServerEvent::UserLeftRoom {
                user_name: identity.clone(),
                room_id: room.to_string(),
            },
        ));
        metrics::set_active_rooms(self.rooms.stats().room_count);
        info!(session = %session_id, identity = %identity, room = %room, "User left room");

        Ok(ServerEvent::RoomLeft {
            room_id: room.to_string(),
            user_name: identity,
        })
    }

    /// Build a message from a client payload and route it.
    ///
    /// An empty sender defaults to the session's identity.
    ///
    /// # Errors
    ///
    /// Fails if the session never joined or the message is invalid.
    pub fn send_message(&self, session_id: &str, mut send: SendMessage) -> Result<usize, HubError> {
        let identity = self.registry.identity_of(session_id)?;
        if send.sender.trim().is_empty() {
            send.sender = identity;
        }

        let message = send
            .into_message(Uuid::new_v4().to_string(), now_millis())
            .map_err(RouterError::InvalidMessage)?;
        Ok(self.router.route(message)?)
    }

    /// Route an already-built message.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::InvalidMessage`] if validation fails.
    pub fn route(&self, message: ChatMessage) -> Result<usize, HubError> {
        Ok(self.router.route(message)?)
    }

    /// Route a typing indicator to a room, excluding the typing session.
    ///
    /// Ignored for an empty room id or a session that never joined.
    pub fn typing(&self, session_id: &str, room: &str, active: bool) {
        if room.is_empty() {
            return;
        }
        let Ok(identity) = self.registry.identity_of(session_id) else {
            debug!(session = %session_id, "Typing from unjoined session ignored");
            return;
        };

        let user_name = identity;
        let room_id = room.to_string();
        let event = if active {
            ServerEvent::Typing { user_name, room_id }
        } else {
            ServerEvent::StopTyping { user_name, room_id }
        };
        self.router.dispatch(
            Envelope::new(
                new_envelope_id(),
                self.instance_id(),
                Target::Room(room.to_string()),
                event,
            )
            .excluding(session_id),
        );
    }

    /// Tear down a session: leave its rooms, unregister it, route presence.
    ///
    /// Durable room membership is kept. Returns `None` for a session that
    /// never joined or was already torn down.
    pub fn disconnect(&self, session_id: &str, reason: &str) -> Option<LeaveOutcome> {
        let rooms = self.rooms.leave_all(session_id);

        let outcome = match self.registry.leave(session_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(session = %session_id, reason = %reason, error = %e, "Disconnect of unjoined session");
                return None;
            }
        };

        if outcome.remaining_device_count == 0 {
            self.forget_session(&outcome.identity);
        }

        let change = PresenceChange::from_leave(session_id, &outcome);
        self.router
            .dispatch(change.into_envelope(new_envelope_id(), self.instance_id()));
        metrics::set_joined_sessions(self.registry.len());
        metrics::set_active_rooms(self.rooms.stats().room_count);

        info!(
            session = %session_id,
            identity = %outcome.identity,
            device = %outcome.device,
            reason = %reason,
            rooms = rooms.len(),
            remaining = outcome.remaining_device_count,
            "Device disconnected"
        );
        Some(outcome)
    }

    /// Local sessions of an identity, in connect order.
    #[must_use]
    pub fn devices_of(&self, identity: &str) -> Vec<SessionId> {
        self.registry.devices_of(identity)
    }

    /// Online identities on this instance.
    #[must_use]
    pub fn online_summary(&self) -> BTreeMap<IdentityKey, OnlineEntry> {
        self.registry.online_summary()
    }

    /// Durable members of a room.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn room_members(&self, room: &str) -> Result<BTreeSet<IdentityKey>, HubError> {
        match self.membership.members(room).await {
            Ok(members) => Ok(members),
            Err(e) => {
                warn!(room = %room, error = %e, "Failed to list room members");
                metrics::record_store_failure("membership_list");
                Err(e.into())
            }
        }
    }

    /// Latest cached session of an identity, on any instance sharing the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the identity has no cached session.
    pub async fn cached_session(&self, identity: &str) -> Result<SessionId, HubError> {
        Ok(self.sessions.get(identity).await?)
    }

    fn cache_session(&self, identity: &str, session_id: &str) {
        let store = Arc::clone(&self.sessions);
        let (identity, session_id) = (identity.to_string(), session_id.to_string());
        spawn_best_effort(async move {
            if let Err(e) = store.put(&identity, &session_id).await {
                warn!(identity = %identity, error = %e, "Failed to cache session");
                metrics::record_store_failure("session_put");
            }
        });
    }

    fn forget_session(&self, identity: &str) {
        let store = Arc::clone(&self.sessions);
        let identity = identity.to_string();
        spawn_best_effort(async move {
            if let Err(e) = store.delete(&identity).await {
                warn!(identity = %identity, error = %e, "Failed to drop cached session");
                metrics::record_store_failure("session_delete");
            }
        });
    }

    /// Fetch a stored message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for unknown or expired ids.
    pub async fn fetch_message(&self, id: &str) -> Result<ChatMessage, HubError> {
        Ok(self.messages.fetch(id).await?)
    }

    /// Id of this instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.relay.instance_id()
    }

    /// Whether the relay subscription is up.
    #[must_use]
    pub fn is_relay_connected(&self) -> bool {
        self.relay.is_connected()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomIndex> {
        &self.rooms
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.registry.len(),
            identities: self.registry.identity_count(),
            rooms: self.rooms.stats(),
            router: self.router.stats(),
            relay: self.relay.stats(),
        }
    }
}
