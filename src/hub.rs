//! In-process room hub implementing the channel contract.
//!
//! One hub hosts many named rooms; each room fans broadcasts out to its
//! members. Frames travel encoded and are decoded at the hub boundary, so
//! a malformed frame is logged, counted, and dropped without disturbing
//! any session.
//!
//! The hub doubles as the test transport: it can echo a sender's own
//! broadcasts back, deliver every frame twice (at-least-once delivery),
//! refuse subscription attempts, and forcibly drop members.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelStatus};
use crate::protocol::{ClientId, RoomEvent};

/// Delivery behavior knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubConfig {
    /// Loop a sender's own broadcasts back to it.
    pub echo: bool,
    /// Deliver every frame twice.
    pub duplicate: bool,
}

/// Per-room delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

struct Room {
    members: HashMap<ClientId, mpsc::UnboundedSender<ChannelEvent>>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            messages_sent: 0,
            messages_dropped: 0,
        }
    }
}

struct HubInner {
    rooms: HashMap<String, Room>,
    config: HubConfig,
    /// Number of upcoming subscribe attempts to reject.
    refuse_subscribes: u32,
}

impl HubInner {
    /// Decode one frame and fan it out. `sender` is excluded unless echo
    /// is on; `None` delivers to every member (injected frames).
    fn deliver(&mut self, room_name: &str, sender: Option<ClientId>, bytes: &[u8]) {
        let echo = self.config.echo;
        let copies = if self.config.duplicate { 2 } else { 1 };

        let Some(room) = self.rooms.get_mut(room_name) else {
            return;
        };

        let event = match RoomEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed frame in room {room_name}: {e}");
                room.messages_dropped += 1;
                return;
            }
        };

        room.messages_sent += 1;
        for (member, tx) in &room.members {
            if !echo && Some(*member) == sender {
                continue;
            }
            for _ in 0..copies {
                let _ = tx.send(ChannelEvent::Broadcast(event.clone()));
            }
        }
    }

    fn notify_members(&mut self, room_name: &str, except: ClientId, event: ChannelEvent) {
        if let Some(room) = self.rooms.get_mut(room_name) {
            for (member, tx) in &room.members {
                if *member != except {
                    let _ = tx.send(event.clone());
                }
            }
        }
    }

    fn remove_if_empty(&mut self, room_name: &str) {
        if self
            .rooms
            .get(room_name)
            .is_some_and(|room| room.members.is_empty())
        {
            self.rooms.remove(room_name);
        }
    }
}

/// An in-process pub/sub hub hosting named rooms.
#[derive(Clone)]
pub struct RoomHub {
    inner: Arc<Mutex<HubInner>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                rooms: HashMap::new(),
                config,
                refuse_subscribes: 0,
            })),
        }
    }

    /// Create a channel handle for one client in one room. The room itself
    /// is created lazily on first subscribe and removed when its last
    /// member leaves.
    pub fn channel(&self, room: impl Into<String>, client_id: ClientId) -> HubChannel {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        HubChannel {
            inner: self.inner.clone(),
            room: room.into(),
            client_id,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Reject the next `n` subscribe attempts with an `Errored` status.
    pub fn refuse_subscriptions(&self, n: u32) {
        self.inner.lock().expect("hub lock poisoned").refuse_subscribes = n;
    }

    /// Forcibly drop a member, as a flaky network would: the victim sees
    /// `Closed`, the rest of the room sees a presence leave.
    pub fn drop_member(&self, room: &str, client_id: ClientId) -> bool {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let Some(tx) = inner
            .rooms
            .get_mut(room)
            .and_then(|r| r.members.remove(&client_id))
        else {
            return false;
        };
        let _ = tx.send(ChannelEvent::Status(ChannelStatus::Closed));
        inner.notify_members(room, client_id, ChannelEvent::PresenceLeave(vec![client_id]));
        inner.remove_if_empty(room);
        true
    }

    /// Inject a raw frame into a room, bypassing encoding. Used to verify
    /// that undecodable payloads are dropped without killing sessions.
    pub fn inject_raw(&self, room: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.deliver(room, None, bytes);
    }

    pub fn stats(&self, room: &str) -> Option<RoomStats> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner.rooms.get(room).map(|r| RoomStats {
            messages_sent: r.messages_sent,
            messages_dropped: r.messages_dropped,
            active_members: r.members.len(),
        })
    }

    pub fn members(&self, room: &str) -> Vec<ClientId> {
        let inner = self.inner.lock().expect("hub lock poisoned");
        inner
            .rooms
            .get(room)
            .map(|r| r.members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().expect("hub lock poisoned").rooms.len()
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's handle onto a hub room.
pub struct HubChannel {
    inner: Arc<Mutex<HubInner>>,
    room: String,
    client_id: ClientId,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl HubChannel {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    fn is_member(&self, inner: &HubInner) -> bool {
        inner
            .rooms
            .get(&self.room)
            .is_some_and(|r| r.members.contains_key(&self.client_id))
    }
}

impl Channel for HubChannel {
    fn subscribe(&mut self) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");

        if inner.refuse_subscribes > 0 {
            inner.refuse_subscribes -= 1;
            let _ = self
                .events_tx
                .send(ChannelEvent::Status(ChannelStatus::Errored));
            return;
        }

        // Membership, not a local flag, is the idempotence check: a member
        // dropped by the hub resubscribes through this same path. A live
        // member gets its status re-confirmed without a new session.
        if self.is_member(&inner) {
            let _ = self
                .events_tx
                .send(ChannelEvent::Status(ChannelStatus::Subscribed));
            let _ = self.events_tx.send(ChannelEvent::PresenceSync);
            return;
        }

        inner
            .rooms
            .entry(self.room.clone())
            .or_insert_with(Room::new)
            .members
            .insert(self.client_id, self.events_tx.clone());

        inner.notify_members(
            &self.room,
            self.client_id,
            ChannelEvent::PresenceJoin(vec![self.client_id]),
        );

        let _ = self
            .events_tx
            .send(ChannelEvent::Status(ChannelStatus::Subscribed));
        let _ = self.events_tx.send(ChannelEvent::PresenceSync);
    }

    fn unsubscribe(&mut self) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        let removed = inner
            .rooms
            .get_mut(&self.room)
            .and_then(|r| r.members.remove(&self.client_id))
            .is_some();
        if removed {
            inner.notify_members(
                &self.room,
                self.client_id,
                ChannelEvent::PresenceLeave(vec![self.client_id]),
            );
            inner.remove_if_empty(&self.room);
        }
    }

    fn broadcast(&mut self, event: &RoomEvent) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        if !self.is_member(&inner) {
            return Err(ChannelError::NotSubscribed);
        }
        let bytes = event
            .encode()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        inner.deliver(&self.room, Some(self.client_id), &bytes);
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.take()
    }
}
