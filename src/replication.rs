//! Document delta replication without feedback loops.
//!
//! Local mutations become `update` broadcasts; remote broadcasts are
//! applied to the document under this provider's origin tag. The document
//! re-emits applied updates through its mutation callback, so the origin
//! tag is the loop breaker: anything tagged with our own origin is never
//! rebroadcast.
//!
//! No ordering or deduplication is imposed. The transport is at-least-once
//! and unordered; convergence rests on the document's commutative,
//! idempotent merge.

use crate::document::{Document, OriginTag};
use crate::protocol::{ClientId, RoomEvent};

pub struct ReplicationProtocol {
    origin: OriginTag,
}

impl ReplicationProtocol {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            origin: OriginTag::provider(client_id),
        }
    }

    /// The tag this provider applies remote updates under.
    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    /// True when a document mutation was caused by this provider applying
    /// a remote update, and therefore must not be rebroadcast.
    pub fn is_self_originated(&self, tag: &OriginTag) -> bool {
        *tag == self.origin
    }

    /// Turn a document mutation into an outbound broadcast, or `None`
    /// when the mutation is our own remote apply echoing back.
    pub fn outbound_update(&self, update: &[u8], origin: &OriginTag) -> Option<RoomEvent> {
        if self.is_self_originated(origin) {
            return None;
        }
        Some(RoomEvent::Update {
            update: update.to_vec(),
        })
    }

    /// Apply a remote `update` or `sync` payload to the document.
    ///
    /// A payload the document rejects is logged and dropped; one bad
    /// message never tears down the session.
    pub fn apply_remote(&self, document: &dyn Document, payload: &[u8]) {
        if let Err(e) = document.apply_update(payload, &self.origin) {
            log::warn!("Dropping undecodable remote update ({} bytes): {e}", payload.len());
        }
    }

    /// Full-state broadcast sent on every transition to Connected, so a
    /// (re)joining participant converges even if it missed incremental
    /// deltas while away.
    pub fn full_sync_event(&self, document: &dyn Document) -> RoomEvent {
        RoomEvent::Sync {
            state: document.encode_full_state(),
        }
    }
}
