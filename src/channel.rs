//! The transport contract consumed by the provider.
//!
//! A channel is one named pub/sub topic carrying the room's broadcasts and
//! presence events. Delivery is at-most-once per copy and unordered; the
//! protocol layers above tolerate duplicates and reordering by design.
//!
//! Subscription is initiated with [`Channel::subscribe`] and the outcome
//! arrives asynchronously as a [`ChannelEvent::Status`] on the event
//! receiver, so transport failures always flow through the same path as
//! later disconnects.

use tokio::sync::mpsc;

use crate::protocol::{ClientId, RoomEvent};

/// Lifecycle status reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscription is live; broadcasts flow.
    Subscribed,
    /// The transport closed the session.
    Closed,
    /// The subscription attempt or session errored.
    Errored,
}

/// Everything a channel can deliver to its owner.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Subscription lifecycle change.
    Status(ChannelStatus),
    /// A broadcast from some peer in the room.
    Broadcast(RoomEvent),
    /// Clients joined the room.
    PresenceJoin(Vec<ClientId>),
    /// Clients left the room.
    PresenceLeave(Vec<ClientId>),
    /// The transport reconciled the full membership list.
    PresenceSync,
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// Broadcast attempted without a live subscription.
    NotSubscribed,
    /// The transport rejected or dropped the payload.
    Transport(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSubscribed => write!(f, "Channel is not subscribed"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// A named room topic.
///
/// Implementations own one transport session per instance. `subscribe` may
/// be called again after a `Closed`/`Errored` status to re-establish the
/// session on the same event stream.
pub trait Channel: Send {
    /// Initiate (or re-initiate) the subscription. Idempotent while a
    /// subscription is already live. Never returns an error: failures are
    /// reported as a `Status` event.
    fn subscribe(&mut self);

    /// Tear down the subscription and leave the room.
    fn unsubscribe(&mut self);

    /// Broadcast an event to the room.
    fn broadcast(&mut self, event: &RoomEvent) -> Result<(), ChannelError>;

    /// Take the event receiver. Yields `Some` exactly once; the stream
    /// stays valid across resubscribes.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}
