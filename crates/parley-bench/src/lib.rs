//! Shared fixtures for the Parley benchmarks.

use parley_core::{Hub, HubConfig, MemoryBus, MemoryMembershipStore, MemoryMessageStore};
use parley_protocol::{JoinPayload, ServerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A hub on in-memory backends with `sessions` joined sessions.
///
/// Every session is a distinct identity and is a member of `room`.
pub struct Fixture {
    pub hub: Hub,
    pub inboxes: Vec<mpsc::Receiver<Arc<ServerEvent>>>,
}

impl Fixture {
    #[must_use]
    pub fn new(sessions: usize, room: &str) -> Self {
        let hub = Hub::new(
            HubConfig::default(),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryMembershipStore::new()),
            Arc::new(MemoryBus::new()),
        );

        let mut inboxes = Vec::with_capacity(sessions);
        for i in 0..sessions {
            let (tx, rx) = mpsc::channel(1024);
            let session = format!("session-{i}");
            let payload = JoinPayload {
                user_name: format!("user-{i}"),
                device_info: None,
                avatar: None,
                display_name: None,
                metadata: Default::default(),
            };
            if hub.join(&session, payload, tx).is_ok() {
                let _ = hub.join_room(&session, room);
            }
            inboxes.push(rx);
        }

        let mut fixture = Self { hub, inboxes };
        fixture.drain();
        fixture
    }

    /// Empty every inbox, returning the number of events drained.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for rx in &mut self.inboxes {
            while rx.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
