//! Local room index.
//!
//! Records which locally-owned sessions are socket-joined to which rooms. This
//! is the real-time delivery view; durable membership lives behind
//! [`MembershipStore`](crate::store::MembershipStore).

use dashmap::DashMap;
use parley_protocol::{RoomId, SessionId};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Maximum room id length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// Default per-session room limit.
pub const DEFAULT_MAX_ROOMS_PER_SESSION: usize = 100;

/// Validate a room id.
///
/// # Errors
///
/// Returns an error message if the room id is invalid.
pub fn validate_room_id(room: &str) -> Result<(), &'static str> {
    if room.is_empty() {
        return Err("Room id cannot be empty");
    }
    if room.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room id too long");
    }
    if room.starts_with('$') {
        return Err("Room ids starting with '$' are reserved");
    }
    if !room.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room id contains invalid characters");
    }
    Ok(())
}

/// Room index errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Invalid room id.
    #[error("Invalid room id: {0}")]
    InvalidRoom(&'static str),

    /// The session is not in the room.
    #[error("Not joined to room: {0}")]
    NotJoined(String),

    /// Per-session room limit reached.
    #[error("Maximum rooms per session reached")]
    MaxRoomsReached,
}

/// Socket-level room association for this instance.
///
/// Lock order is always `memberships` before `rooms`.
pub struct RoomIndex {
    /// Sessions by room.
    rooms: DashMap<RoomId, HashSet<SessionId>>,
    /// Rooms by session.
    memberships: DashMap<SessionId, HashSet<RoomId>>,
    max_rooms_per_session: usize,
}

impl RoomIndex {
    /// Create an index with the default room limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ROOMS_PER_SESSION)
    }

    /// Create an index allowing `max_rooms_per_session` rooms per session.
    #[must_use]
    pub fn with_limit(max_rooms_per_session: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            max_rooms_per_session,
        }
    }

    /// Socket-join a session to a room.
    ///
    /// Returns `false` if the session was already in the room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room id is invalid or the limit is reached.
    pub fn join(&self, session_id: &str, room: &str) -> Result<bool, RoomError> {
        validate_room_id(room).map_err(RoomError::InvalidRoom)?;

        let mut joined = self
            .memberships
            .entry(session_id.to_string())
            .or_default();

        if joined.contains(room) {
            return Ok(false);
        }
        if joined.len() >= self.max_rooms_per_session {
            return Err(RoomError::MaxRoomsReached);
        }

        let mut sessions = self.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating room");
            HashSet::new()
        });
        sessions.insert(session_id.to_string());
        joined.insert(room.to_string());

        debug!(
            room = %room,
            session = %session_id,
            sessions = sessions.len(),
            "Joined room"
        );
        Ok(true)
    }

    /// Socket-leave a room.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::NotJoined`] if the session is not in the room.
    pub fn leave(&self, session_id: &str, room: &str) -> Result<(), RoomError> {
        {
            let mut joined = self
                .memberships
                .get_mut(session_id)
                .ok_or_else(|| RoomError::NotJoined(room.to_string()))?;
            if !joined.remove(room) {
                return Err(RoomError::NotJoined(room.to_string()));
            }
            self.remove_from_room(session_id, room);
        }

        self.memberships
            .remove_if(session_id, |_, rooms| rooms.is_empty());
        debug!(room = %room, session = %session_id, "Left room");
        Ok(())
    }

    /// Remove a session from every room. Returns the rooms it left.
    pub fn leave_all(&self, session_id: &str) -> Vec<RoomId> {
        let Some((_, rooms)) = self.memberships.remove(session_id) else {
            return Vec::new();
        };

        for room in &rooms {
            self.remove_from_room(session_id, room);
        }

        debug!(session = %session_id, rooms = rooms.len(), "Left all rooms");
        rooms.into_iter().collect()
    }

    fn remove_from_room(&self, session_id: &str, room: &str) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut sessions) => {
                sessions.remove(session_id);
                sessions.is_empty()
            }
            None => false,
        };

        if now_empty
            && self
                .rooms
                .remove_if(room, |_, sessions| sessions.is_empty())
                .is_some()
        {
            debug!(room = %room, "Deleted empty room");
        }
    }

    /// Sessions socket-joined to a room.
    #[must_use]
    pub fn sessions_in(&self, room: &str) -> Vec<SessionId> {
        self.rooms
            .get(room)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a session is socket-joined to.
    #[must_use]
    pub fn rooms_of(&self, session_id: &str) -> Vec<RoomId> {
        self.memberships
            .get(session_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a session is in a room.
    #[must_use]
    pub fn is_member(&self, session_id: &str, room: &str) -> bool {
        self.memberships
            .get(session_id)
            .is_some_and(|r| r.contains(room))
    }

    /// Whether any local session is in the room.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Index statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_count: self.rooms.len(),
            session_count: self.memberships.len(),
            total_memberships: self.memberships.iter().map(|r| r.len()).sum(),
        }
    }
}

impl Default for RoomIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Room index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    /// Rooms with at least one local session.
    pub room_count: usize,
    /// Sessions in at least one room.
    pub session_count: usize,
    /// Session-room pairs.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("general").is_ok());
        assert!(validate_room_id("team:backend").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("$system").is_err());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
        assert!(validate_room_id("tab\there").is_err());
        assert!(validate_room_id("café").is_err());
    }

    #[test]
    fn test_join_and_leave() {
        let index = RoomIndex::new();

        assert!(index.join("s-1", "general").unwrap());
        assert!(index.join("s-2", "general").unwrap());
        assert!(index.is_member("s-1", "general"));

        let mut sessions = index.sessions_in("general");
        sessions.sort();
        assert_eq!(sessions, vec!["s-1", "s-2"]);

        index.leave("s-1", "general").unwrap();
        assert_eq!(index.sessions_in("general"), vec!["s-2"]);
        assert!(index.rooms_of("s-1").is_empty());

        index.leave("s-2", "general").unwrap();
        assert!(!index.room_exists("general"));
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let index = RoomIndex::new();
        assert!(index.join("s-1", "general").unwrap());
        assert!(!index.join("s-1", "general").unwrap());
        assert_eq!(index.sessions_in("general").len(), 1);
    }

    #[test]
    fn test_leave_not_joined() {
        let index = RoomIndex::new();
        assert_eq!(
            index.leave("s-1", "general"),
            Err(RoomError::NotJoined("general".into()))
        );

        index.join("s-1", "random").unwrap();
        assert!(matches!(
            index.leave("s-1", "general"),
            Err(RoomError::NotJoined(_))
        ));
    }

    #[test]
    fn test_room_limit() {
        let index = RoomIndex::with_limit(2);
        index.join("s-1", "a").unwrap();
        index.join("s-1", "b").unwrap();
        assert_eq!(index.join("s-1", "c"), Err(RoomError::MaxRoomsReached));
        // already-joined rooms do not count against the limit
        assert_eq!(index.join("s-1", "a"), Ok(false));
    }

    #[test]
    fn test_leave_all() {
        let index = RoomIndex::new();
        index.join("s-1", "a").unwrap();
        index.join("s-1", "b").unwrap();
        index.join("s-2", "b").unwrap();

        let mut left = index.leave_all("s-1");
        left.sort();
        assert_eq!(left, vec!["a", "b"]);
        assert!(!index.room_exists("a"));
        assert_eq!(index.sessions_in("b"), vec!["s-2"]);
        assert!(index.leave_all("s-1").is_empty());
    }

    #[test]
    fn test_stats() {
        let index = RoomIndex::new();
        index.join("s-1", "a").unwrap();
        index.join("s-1", "b").unwrap();
        index.join("s-2", "a").unwrap();

        let stats = index.stats();
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.total_memberships, 3);
    }

    #[test]
    fn test_concurrent_joins_and_leaves() {
        let index = Arc::new(RoomIndex::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    let session = format!("s-{t}");
                    for i in 0..100 {
                        let room = format!("room-{}", i % 5);
                        index.join(&session, &room).unwrap();
                        if i % 2 == 1 {
                            index.leave_all(&session);
                        }
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }

        // every thread ends after a leave_all
        let stats = index.stats();
        assert_eq!(stats.total_memberships, 0);
        assert_eq!(stats.room_count, 0);
    }
}
