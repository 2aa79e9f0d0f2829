//! # boardsync — real-time board synchronization transport
//!
//! Keeps a shared, conflict-free board document consistent across
//! concurrently connected clients, and layers an ephemeral presence
//! protocol (cursors, selections, roster) on the same channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  update/sync   ┌──────────────┐
//! │ Provider A   │ ◄────────────► │ Provider B   │
//! │ (per room)   │   awareness    │ (per room)   │
//! └──────┬───────┘                └──────┬───────┘
//!        │                               │
//!        ▼                               ▼
//! ┌──────────────┐                ┌──────────────┐
//! │ Document     │                │ Document     │
//! │ (CRDT, ext.) │                │ (CRDT, ext.) │
//! └──────────────┘                └──────────────┘
//! ```
//!
//! The document merge algorithm and the wire transport are both opaque
//! collaborators behind the [`Document`] and [`Channel`] traits. This
//! crate owns what happens between them: connection lifecycle with
//! bounded exponential backoff, loop-free delta replication with
//! full-state catch-up on every (re)connect, and presence bookkeeping
//! that never shows a stale collaborator.
//!
//! ## Modules
//!
//! - [`protocol`] — wire event types (closed tagged enum, bincode)
//! - [`document`] — document contract + in-memory convergent reference
//! - [`channel`] — transport contract
//! - [`hub`] — in-process room hub (the crate's own transport)
//! - [`connection`] — status state machine, backoff, reconnect timer
//! - [`replication`] — delta replication, origin-tag loop breaker
//! - [`presence`] — presence registry and local state cache
//! - [`provider`] — the facade composing all of the above

pub mod channel;
pub mod connection;
pub mod document;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod replication;

// Re-exports for convenience
pub use channel::{Channel, ChannelError, ChannelEvent, ChannelStatus};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionStatus, ReconnectConfig, ReconnectSchedule,
    ReconnectTimer,
};
pub use document::{Document, DocumentError, DocumentSubscription, MemoryDocument, OriginTag};
pub use hub::{HubChannel, HubConfig, RoomHub, RoomStats};
pub use presence::{PresenceRegistry, StatePatch};
pub use protocol::{
    ClientId, CollabColor, CollaboratorState, ElementId, Point, ProtocolError, RoomEvent,
    UserProfile,
};
pub use provider::{CollabProvider, ListenerId, ListenerSet, ProviderOptions};
pub use replication::ReplicationProtocol;
