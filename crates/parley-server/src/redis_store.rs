//! Redis adapters for the core's store and bus traits.
//!
//! Messages live under `message:{id}` as JSON with an expiry, room members in
//! the set `room_members:{room}`, and each identity's latest session under
//! `user_session:{identity}` with its own expiry. The bus is plain Redis pub/sub.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use parley_core::{BusError, MembershipStore, MessageStore, PubSub, SessionStore, StoreError};
use parley_protocol::{ChatMessage, IdentityKey, SessionId};
use redis::aio::ConnectionManager;
use std::collections::BTreeSet;
use tracing::{debug, info};

fn message_key(id: &str) -> String {
    format!("message:{id}")
}

fn room_key(room: &str) -> String {
    format!("room_members:{room}")
}

fn session_key(identity: &str) -> String {
    format!("user_session:{identity}")
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Message, membership and session store on one Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    message_ttl_secs: u64,
    session_ttl_secs: u64,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(
        url: &str,
        message_ttl_secs: u64,
        session_ttl_secs: u64,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        info!("Redis store connected");
        Ok(Self {
            conn,
            message_ttl_secs,
            session_ttl_secs,
        })
    }
}

#[async_trait]
impl MessageStore for RedisStore {
    async fn store(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(message).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(message_key(&message.id))
            .arg(self.message_ttl_secs)
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)?;
        debug!(message = %message.id, "Message stored");
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<ChatMessage, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = redis::cmd("GET")
            .arg(message_key(id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let json = json.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl MembershipStore for RedisStore {
    async fn add(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(room_key(room))
            .arg(identity)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn remove(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(room_key(room))
            .arg(identity)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn list(&self, room: &str) -> Result<BTreeSet<IdentityKey>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(room_key(room))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(members.into_iter().collect())
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn put(&self, identity: &str, session_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(session_key(identity))
            .arg(self.session_ttl_secs)
            .arg(session_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn get(&self, identity: &str) -> Result<SessionId, StoreError> {
        let mut conn = self.conn.clone();
        let session: Option<String> = redis::cmd("GET")
            .arg(session_key(identity))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        session.ok_or_else(|| StoreError::NotFound(identity.to_string()))
    }

    async fn delete(&self, identity: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(session_key(identity))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }
}

/// Redis pub/sub bus.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unavailable`] if Redis cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        info!("Redis bus connected");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.to_vec())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        debug!(channel = %channel, "Redis subscription established");
        // The stream ends when the pub/sub connection drops.
        Ok(pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()))
            .boxed())
    }
}
