//! Durable message, membership and session stores.
//!
//! The core only talks to storage through these traits. The in-memory
//! implementations back single-instance deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parley_protocol::{ChatMessage, IdentityKey, MessageId, RoomId, SessionId};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Storage errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// No such record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Short-lived message cache.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a message under its id.
    async fn store(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Fetch a message by id.
    async fn fetch(&self, id: &str) -> Result<ChatMessage, StoreError>;
}

/// Durable room membership sets.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Add an identity to a room.
    async fn add(&self, room: &str, identity: &str) -> Result<(), StoreError>;

    /// Remove an identity from a room.
    async fn remove(&self, room: &str, identity: &str) -> Result<(), StoreError>;

    /// Identities in a room.
    async fn list(&self, room: &str) -> Result<BTreeSet<IdentityKey>, StoreError>;
}

/// Short-lived cache of the latest session of each identity.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Remember `session_id` as the identity's latest session.
    async fn put(&self, identity: &str, session_id: &str) -> Result<(), StoreError>;

    /// Latest session of an identity.
    async fn get(&self, identity: &str) -> Result<SessionId, StoreError>;

    /// Forget the identity's session.
    async fn delete(&self, identity: &str) -> Result<(), StoreError>;
}

/// How long a cached session lives.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Default number of messages kept by [`MemoryMessageStore`].
pub const DEFAULT_MEMORY_MESSAGES: usize = 10_000;

#[derive(Default)]
struct MessageLog {
    messages: HashMap<MessageId, ChatMessage>,
    order: VecDeque<MessageId>,
}

/// Bounded in-memory message store; the oldest message is evicted first.
pub struct MemoryMessageStore {
    log: Mutex<MessageLog>,
    capacity: usize,
}

impl MemoryMessageStore {
    /// Create a store with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_MESSAGES)
    }

    /// Create a store keeping at most `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: Mutex::new(MessageLog::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log
            .messages
            .insert(message.id.clone(), message.clone())
            .is_none()
        {
            log.order.push_back(message.id.clone());
        }
        while log.order.len() > self.capacity {
            if let Some(oldest) = log.order.pop_front() {
                log.messages.remove(&oldest);
            }
        }
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<ChatMessage, StoreError> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// In-memory membership store.
#[derive(Default)]
pub struct MemoryMembershipStore {
    rooms: DashMap<RoomId, BTreeSet<IdentityKey>>,
}

impl MemoryMembershipStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn add(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(identity.to_string());
        Ok(())
    }

    async fn remove(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(identity);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
        Ok(())
    }

    async fn list(&self, room: &str) -> Result<BTreeSet<IdentityKey>, StoreError> {
        Ok(self
            .rooms
            .get(room)
            .map(|m| m.clone())
            .unwrap_or_default())
    }
}

/// In-memory session cache with expiry.
pub struct MemorySessionStore {
    sessions: DashMap<IdentityKey, (SessionId, Instant)>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Create a cache with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }

    /// Create a cache whose entries expire after `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, identity: &str, session_id: &str) -> Result<(), StoreError> {
        self.sessions.insert(
            identity.to_string(),
            (session_id.to_string(), Instant::now() + self.ttl),
        );
        Ok(())
    }

    async fn get(&self, identity: &str) -> Result<SessionId, StoreError> {
        let now = Instant::now();
        self.sessions.remove_if(identity, |_, (_, expires)| *expires <= now);
        self.sessions
            .get(identity)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn delete(&self, identity: &str) -> Result<(), StoreError> {
        self.sessions.remove(identity);
        Ok(())
    }
}
