//! Room membership tracker.
//!
//! A thin facade over the durable [`MembershipStore`]. Nothing is cached here;
//! every query goes to the store.

use parley_protocol::IdentityKey;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;

use crate::metrics;
use crate::store::{MembershipStore, StoreError};

/// Durable membership facade.
#[derive(Clone)]
pub struct MembershipTracker {
    store: Arc<dyn MembershipStore>,
}

impl MembershipTracker {
    /// Wrap a membership store.
    #[must_use]
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// Add an identity to a room.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn add_member(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        self.store.add(room, identity).await
    }

    /// Remove an identity from a room.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn remove_member(&self, room: &str, identity: &str) -> Result<(), StoreError> {
        self.store.remove(room, identity).await
    }

    /// Identities in a room.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn members(&self, room: &str) -> Result<BTreeSet<IdentityKey>, StoreError> {
        self.store.list(room).await
    }

    /// Record a join in the background.
    pub fn record_join(&self, room: &str, identity: &str) {
        let tracker = self.clone();
        let (room, identity) = (room.to_string(), identity.to_string());
        spawn_best_effort(async move {
            if let Err(e) = tracker.add_member(&room, &identity).await {
                warn!(room = %room, identity = %identity, error = %e, "Failed to record room join");
                metrics::record_store_failure("membership_add");
            }
        });
    }

    /// Record a leave in the background.
    pub fn record_leave(&self, room: &str, identity: &str) {
        let tracker = self.clone();
        let (room, identity) = (room.to_string(), identity.to_string());
        spawn_best_effort(async move {
            if let Err(e) = tracker.remove_member(&room, &identity).await {
                warn!(room = %room, identity = %identity, error = %e, "Failed to record room leave");
                metrics::record_store_failure("membership_remove");
            }
        });
    }
}

/// Spawn a store write on the current runtime, or skip it if there is none.
pub(crate) fn spawn_best_effort<F>(task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => warn!("No tokio runtime; skipping background store write"),
    }
}
