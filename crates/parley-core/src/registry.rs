//! Identity and session registry.
//!
//! Tracks the sessions joined on this instance and, per identity, the ordered
//! set of devices (sessions) it currently has. Both maps are sharded
//! [`DashMap`]s; a device set is only mutated while holding its shard lock, so
//! concurrent joins and leaves for the same identity never lose updates.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{now_millis, IdentityKey, ServerEvent, SessionId, Status};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::dedup::{SeenCache, DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL};
use crate::session::{Identity, Outbound, Session, SessionHandle};

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Empty identity key on join.
    #[error("Identity key cannot be empty")]
    InvalidIdentity,

    /// The session already joined.
    #[error("Session already joined: {0}")]
    AlreadyJoined(SessionId),

    /// Unknown session.
    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

/// Outcome of a successful join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// This is the identity's only active device.
    pub is_first_device: bool,
    /// Devices the identity has after the join.
    pub device_count: usize,
}

/// Outcome of a successful leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Identity the session belonged to.
    pub identity: IdentityKey,
    /// Device descriptor of the departed session.
    pub device: String,
    /// Devices the identity still has.
    pub remaining_device_count: usize,
}

/// One device of an online identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub session_id: SessionId,
    pub device_info: String,
    pub connected_at: u64,
}

/// Presence summary for one online identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineEntry {
    /// Always online; offline identities are not listed.
    pub status: Status,
    pub device_count: usize,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug)]
struct DeviceSet {
    identity: Identity,
    sessions: Vec<SessionId>,
}

/// The session registry for this instance.
pub struct Registry {
    /// Joined sessions by id.
    sessions: DashMap<SessionId, Session>,
    /// Device sets by identity key, in connect order.
    devices: DashMap<IdentityKey, DeviceSet>,
    seen_ttl: Duration,
    seen_capacity: usize,
}

impl Registry {
    /// Create a registry with the default dedup window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_dedup(DEFAULT_SEEN_TTL, DEFAULT_SEEN_CAPACITY)
    }

    /// Create a registry whose sessions remember delivery ids for `ttl`,
    /// up to `capacity` ids each.
    #[must_use]
    pub fn with_dedup(ttl: Duration, capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            devices: DashMap::new(),
            seen_ttl: ttl,
            seen_capacity: capacity,
        }
    }

    /// Join a session to an identity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidIdentity`] for an empty key and
    /// [`RegistryError::AlreadyJoined`] if the session already joined.
    pub fn join(
        &self,
        session_id: &str,
        identity: Identity,
        device: impl Into<String>,
        outbound: Outbound,
    ) -> Result<JoinOutcome, RegistryError> {
        self.join_greeted(session_id, identity, device, outbound, |_| None)
    }

    /// Join a session, queueing `greeting` on its outbound channel before the
    /// session is reachable by any fan-out.
    ///
    /// `greeting` runs under the identity's shard lock and must not call back
    /// into the registry.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::join`].
    pub fn join_greeted<F>(
        &self,
        session_id: &str,
        identity: Identity,
        device: impl Into<String>,
        outbound: Outbound,
        greeting: F,
    ) -> Result<JoinOutcome, RegistryError>
    where
        F: FnOnce(JoinOutcome) -> Option<ServerEvent>,
    {
        if identity.key.trim().is_empty() {
            return Err(RegistryError::InvalidIdentity);
        }
        if self.sessions.contains_key(session_id) {
            return Err(RegistryError::AlreadyJoined(session_id.to_string()));
        }

        // Lock order: device set, then session entry.
        let key = identity.key.clone();
        let mut set = self.devices.entry(key.clone()).or_insert_with(|| DeviceSet {
            identity: identity.clone(),
            sessions: Vec::new(),
        });

        let vacant = match self.sessions.entry(session_id.to_string()) {
            Entry::Vacant(vacant) => vacant,
            Entry::Occupied(_) => {
                drop(set);
                self.devices.remove_if(&key, |_, set| set.sessions.is_empty());
                return Err(RegistryError::AlreadyJoined(session_id.to_string()));
            }
        };

        let device_count = set.sessions.len() + 1;
        let outcome = JoinOutcome {
            is_first_device: device_count == 1,
            device_count,
        };

        let handle = SessionHandle::new(
            session_id,
            outbound,
            SeenCache::new(self.seen_ttl, self.seen_capacity),
        );
        if let Some(event) = greeting(outcome) {
            handle.send_direct(event);
        }

        // The session entry is complete before it becomes visible in a device set.
        vacant.insert(Session {
            id: session_id.to_string(),
            identity: key,
            device: device.into(),
            connected_at: now_millis(),
            handle: Arc::new(handle),
        });
        set.identity = identity;
        set.sessions.push(session_id.to_string());

        debug!(
            session = %session_id,
            identity = %set.identity.key,
            devices = device_count,
            "Session joined"
        );

        Ok(outcome)
    }

    /// Remove a session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the session never joined or
    /// already left.
    pub fn leave(&self, session_id: &str) -> Result<LeaveOutcome, RegistryError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        let remaining = match self.devices.get_mut(&session.identity) {
            Some(mut set) => {
                set.sessions.retain(|s| s != session_id);
                set.sessions.len()
            }
            None => 0,
        };

        if remaining == 0 {
            // A join that raced in after the retain keeps the set alive.
            self.devices
                .remove_if(&session.identity, |_, set| set.sessions.is_empty());
        }

        debug!(
            session = %session_id,
            identity = %session.identity,
            remaining,
            "Session left"
        );

        Ok(LeaveOutcome {
            identity: session.identity,
            device: session.device,
            remaining_device_count: remaining,
        })
    }

    /// Sessions of an identity in connect order; empty if offline.
    #[must_use]
    pub fn devices_of(&self, identity: &str) -> Vec<SessionId> {
        self.devices
            .get(identity)
            .map(|set| set.sessions.clone())
            .unwrap_or_default()
    }

    /// Identity owning a session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown session.
    pub fn identity_of(&self, session_id: &str) -> Result<IdentityKey, RegistryError> {
        self.sessions
            .get(session_id)
            .map(|s| s.identity.clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))
    }

    /// Latest profile of an online identity.
    #[must_use]
    pub fn identity(&self, key: &str) -> Option<Identity> {
        self.devices.get(key).map(|set| set.identity.clone())
    }

    /// Snapshot of a joined session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Delivery handle of a joined session.
    #[must_use]
    pub fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|s| Arc::clone(&s.handle))
    }

    /// Delivery handles of every joined session.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|s| Arc::clone(&s.handle))
            .collect()
    }

    /// Ids of every joined session.
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// Online identities with their devices.
    #[must_use]
    pub fn online_summary(&self) -> BTreeMap<IdentityKey, OnlineEntry> {
        let sets: Vec<(IdentityKey, Vec<SessionId>)> = self
            .devices
            .iter()
            .map(|set| (set.key().clone(), set.sessions.clone()))
            .collect();

        sets.into_iter()
            .map(|(identity, sessions)| {
                let devices: Vec<DeviceInfo> = sessions
                    .iter()
                    .filter_map(|sid| {
                        self.sessions.get(sid).map(|s| DeviceInfo {
                            session_id: s.id.clone(),
                            device_info: s.device.clone(),
                            connected_at: s.connected_at,
                        })
                    })
                    .collect();
                let entry = OnlineEntry {
                    status: Status::Online,
                    device_count: devices.len(),
                    devices,
                };
                (identity, entry)
            })
            .filter(|(_, entry)| entry.device_count > 0)
            .collect()
    }

    /// Number of joined sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is joined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of online identities.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn outbound() -> Outbound {
        mpsc::channel(8).0
    }

    fn join(registry: &Registry, session: &str, identity: &str) -> JoinOutcome {
        registry
            .join(session, Identity::new(identity), "test-device", outbound())
            .unwrap()
    }

    #[test]
    fn test_multi_device_join_and_leave() {
        let registry = Registry::new();

        let first = join(&registry, "d1", "alice");
        assert!(first.is_first_device);
        assert_eq!(first.device_count, 1);

        let second = join(&registry, "d2", "alice");
        assert!(!second.is_first_device);
        assert_eq!(second.device_count, 2);
        assert_eq!(registry.devices_of("alice"), vec!["d1", "d2"]);

        let left = registry.leave("d1").unwrap();
        assert_eq!(left.identity, "alice");
        assert_eq!(left.remaining_device_count, 1);
        assert_eq!(registry.devices_of("alice"), vec!["d2"]);

        let left = registry.leave("d2").unwrap();
        assert_eq!(left.remaining_device_count, 0);
        assert!(registry.devices_of("alice").is_empty());
        assert_eq!(registry.identity_count(), 0);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let registry = Registry::new();
        let err = registry
            .join("s-1", Identity::new("  "), "phone", outbound())
            .unwrap_err();
        assert_eq!(err, RegistryError::InvalidIdentity);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_join_on_same_session_rejected() {
        let registry = Registry::new();
        join(&registry, "s-1", "alice");

        let err = registry
            .join("s-1", Identity::new("bob"), "phone", outbound())
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyJoined("s-1".into()));
        assert_eq!(registry.devices_of("alice"), vec!["s-1"]);
        assert!(registry.devices_of("bob").is_empty());
    }

    #[test]
    fn test_leave_is_idempotent() {
        let registry = Registry::new();
        join(&registry, "s-1", "alice");

        assert!(registry.leave("s-1").is_ok());
        assert_eq!(
            registry.leave("s-1"),
            Err(RegistryError::NotFound("s-1".into()))
        );
        // never joined
        assert!(matches!(
            registry.leave("ghost"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_identity_of_and_profile_refresh() {
        let registry = Registry::new();
        join(&registry, "s-1", "alice");
        assert_eq!(registry.identity_of("s-1").unwrap(), "alice");
        assert!(registry.identity_of("s-2").is_err());

        registry
            .join(
                "s-2",
                Identity::new("alice").with_display_name("Alice A."),
                "laptop",
                outbound(),
            )
            .unwrap();
        assert_eq!(registry.identity("alice").unwrap().display_name, "Alice A.");
    }

    #[test]
    fn test_online_summary() {
        let registry = Registry::new();
        registry
            .join("s-1", Identity::new("alice"), "phone", outbound())
            .unwrap();
        registry
            .join("s-2", Identity::new("alice"), "laptop", outbound())
            .unwrap();
        join(&registry, "s-3", "bob");

        let summary = registry.online_summary();
        assert_eq!(summary.len(), 2);
        let alice = &summary["alice"];
        assert_eq!(alice.device_count, 2);
        assert_eq!(alice.devices[0].device_info, "phone");
        assert_eq!(alice.devices[1].device_info, "laptop");
        assert_eq!(summary["bob"].device_count, 1);
    }

    #[test]
    fn test_online_summary_reports_status() {
        let registry = Registry::new();
        join(&registry, "s-1", "alice");

        let summary = serde_json::to_value(registry.online_summary()).unwrap();
        assert_eq!(summary["alice"]["status"], "online");
        assert_eq!(summary["alice"]["deviceCount"], 1);
    }

    #[test]
    fn test_greeting_precedes_concurrent_fan_out() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(Registry::new());
        let done = Arc::new(AtomicBool::new(false));
        let broadcaster = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let event = Arc::new(ServerEvent::error("fan-out"));
                let mut i = 0u64;
                while !done.load(Ordering::Relaxed) {
                    i += 1;
                    for handle in registry.handles() {
                        handle.deliver(&format!("b-{i}"), &event);
                    }
                }
            })
        };

        let mut inboxes = Vec::new();
        for i in 0..200 {
            let (tx, rx) = mpsc::channel(64);
            registry
                .join_greeted(&format!("s-{i}"), Identity::new(format!("u-{i}")), "bot", tx, |outcome| {
                    Some(ServerEvent::error(format!("hello {}", outcome.device_count)))
                })
                .unwrap();
            inboxes.push(rx);
        }
        done.store(true, Ordering::Relaxed);
        broadcaster.join().unwrap();

        for mut rx in inboxes {
            let first = rx.try_recv().unwrap();
            assert_eq!(*first, ServerEvent::error("hello 1"));
        }
    }

    /// Replays a pseudo-random join/leave sequence against a simple model.
    #[test]
    fn test_replay_matches_model() {
        let registry = Registry::new();
        let identities = ["alice", "bob", "carol"];
        let mut model: HashMap<&str, Vec<String>> = HashMap::new();
        let mut live: Vec<(String, &str)> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next_session = 0;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if live.is_empty() || seed % 3 != 0 {
                let identity = identities[(seed % 3) as usize];
                let session = format!("s-{next_session}");
                next_session += 1;

                let devices = model.entry(identity).or_default();
                let outcome = join(&registry, &session, identity);
                devices.push(session.clone());
                assert_eq!(outcome.is_first_device, devices.len() == 1);
                assert_eq!(outcome.device_count, devices.len());
                live.push((session, identity));
            } else {
                let (session, identity) = live.remove((seed as usize / 3) % live.len());
                let devices = model.get_mut(identity).unwrap();
                devices.retain(|s| *s != session);

                let outcome = registry.leave(&session).unwrap();
                assert_eq!(outcome.remaining_device_count, devices.len());
            }

            for identity in identities {
                let expected = model.get(identity).cloned().unwrap_or_default();
                assert_eq!(registry.devices_of(identity), expected);
            }
        }
    }

    #[test]
    fn test_concurrent_join_leave_loses_nothing() {
        let registry = Arc::new(Registry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let session = format!("t{t}-s{i}");
                        registry
                            .join(&session, Identity::new("shared"), "bot", mpsc::channel(1).0)
                            .unwrap();
                        // leave every other session again
                        if i % 2 == 0 {
                            registry.leave(&session).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }

        let devices = registry.devices_of("shared");
        assert_eq!(devices.len(), 8 * 100);
        assert_eq!(registry.len(), 8 * 100);
        for session in &devices {
            assert_eq!(registry.identity_of(session).unwrap(), "shared");
        }
    }

    #[test]
    fn test_concurrent_last_leaves_report_zero_once() {
        for _ in 0..50 {
            let registry = Arc::new(Registry::new());
            join(&registry, "a", "alice");
            join(&registry, "b", "alice");

            let handles: Vec<_> = ["a", "b"]
                .into_iter()
                .map(|s| {
                    let registry = Arc::clone(&registry);
                    std::thread::spawn(move || registry.leave(s).unwrap().remaining_device_count)
                })
                .collect();

            let mut remaining: Vec<usize> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            remaining.sort_unstable();
            assert_eq!(remaining, vec![0, 1]);
        }
    }
}
