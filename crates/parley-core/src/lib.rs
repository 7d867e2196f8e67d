//! # parley-core
//!
//! Session registry, fan-out router and cross-instance relay for Parley.
//!
//! This crate holds everything a server instance needs between its transport
//! and its storage:
//!
//! - **Registry** - joined sessions and each identity's device set
//! - **RoomIndex** - which local sessions are socket-joined to which rooms
//! - **Router** - resolves targets and delivers to local sessions
//! - **Relay** - carries routed envelopes between instances over a [`PubSub`] bus
//! - **Hub** - the per-instance entry point the transport talks to
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌─────────┐     ┌──────────┐     ┌─────────────┐
//! │ Connection │────▶│   Hub   │────▶│  Router  │────▶│  Sessions   │
//! └────────────┘     └─────────┘     └──────────┘     └─────────────┘
//!                         │             │    ▲
//!                         ▼             ▼    │
//!                   ┌──────────┐     ┌──────────┐     ┌─────────────┐
//!                   │ Registry │     │  Relay   │◀───▶│  PubSub bus │
//!                   │ RoomIndex│     └──────────┘     └─────────────┘
//!                   └──────────┘
//! ```

pub mod bus;
pub mod dedup;
pub mod hub;
pub mod membership;
pub mod metrics;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod room;
pub mod router;
pub mod session;
pub mod store;

pub use bus::{BusError, MemoryBus, PubSub};
pub use dedup::SeenCache;
pub use hub::{Hub, HubConfig, HubError, HubStats};
pub use membership::MembershipTracker;
pub use presence::PresenceChange;
pub use registry::{JoinOutcome, LeaveOutcome, OnlineEntry, Registry, RegistryError};
pub use relay::{EnvelopeHandler, Relay, RelayConfig, RelayError, RelayStats};
pub use room::{RoomError, RoomIndex, RoomStats};
pub use router::{Router, RouterError, RouterStats};
pub use session::{Delivery, Identity, Outbound, Session, SessionHandle};
pub use store::{
    MembershipStore, MemoryMembershipStore, MemoryMessageStore, MemorySessionStore, MessageStore,
    SessionStore, StoreError,
};
