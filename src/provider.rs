//! The provider facade: one document + one channel, kept in sync.
//!
//! ```text
//! UI edits ──► Document ──update(origin)──► driver ──► Channel.broadcast
//!                 ▲                           │
//!                 └──apply_update(remote)─────┤
//!                                             │
//! setLocalState ──► PresenceRegistry ─────────┤
//! status / awareness listeners ◄──────────────┘
//! ```
//!
//! All protocol state is owned by a single driver task, so handlers run
//! to completion without interleaving. The facade talks to the driver
//! over an unbounded command channel and reads short-lived snapshots
//! (status, presence, listeners) guarded by plain mutexes that are never
//! held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelEvent, ChannelStatus};
use crate::connection::{
    ConnectionAction, ConnectionEvent, ConnectionManager, ConnectionStatus, ReconnectConfig,
    ReconnectTimer,
};
use crate::document::{Document, DocumentSubscription, OriginTag};
use crate::presence::{PresenceRegistry, StatePatch};
use crate::protocol::{ClientId, CollaboratorState, RoomEvent, UserProfile};
use crate::replication::ReplicationProtocol;

/// Stable handle for one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Owned collection of callbacks with O(1) unsubscribe.
///
/// Callbacks are stored as shared handles so a holder can `snapshot` them
/// and invoke outside whatever lock guards the set. A listener may then
/// subscribe or unsubscribe (including itself) from inside its callback.
pub struct ListenerSet<T> {
    next_id: u64,
    entries: HashMap<u64, Arc<dyn Fn(&T) + Send + Sync>>,
}

impl<T> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Arc::new(listener));
        ListenerId(id)
    }

    /// Returns true when the id was registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.entries.remove(&id.0).is_some()
    }

    /// Clone out the current callbacks, to be invoked after the guard on
    /// this set is released.
    pub fn snapshot(&self) -> Vec<Arc<dyn Fn(&T) + Send + Sync>> {
        self.entries.values().cloned().collect()
    }

    pub fn notify(&self, value: &T) {
        for listener in self.entries.values() {
            listener(value);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider construction options.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Identity announced through presence.
    pub user: UserProfile,
    pub reconnect: ReconnectConfig,
}

impl ProviderOptions {
    pub fn new(user: UserProfile) -> Self {
        Self {
            user,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// State shared between the facade and the driver task.
struct ProviderShared {
    status: Mutex<ConnectionStatus>,
    presence: Mutex<PresenceRegistry>,
    /// Reconnect timer, shared so `destroy` can cancel it synchronously.
    timer: Mutex<ReconnectTimer>,
    status_listeners: Mutex<ListenerSet<ConnectionEvent>>,
    awareness_listeners: Mutex<ListenerSet<HashMap<ClientId, CollaboratorState>>>,
}

impl ProviderShared {
    // Listeners run with the set's lock released, so a callback can
    // unsubscribe itself (or register another listener) without deadlock.
    fn notify_status(&self, event: ConnectionEvent) {
        if let ConnectionEvent::StatusChanged(status) = event {
            *self.status.lock().expect("status lock poisoned") = status;
        }
        let listeners = self
            .status_listeners
            .lock()
            .expect("listener lock poisoned")
            .snapshot();
        for listener in listeners {
            listener(&event);
        }
    }

    fn notify_awareness(&self) {
        let peers = self
            .presence
            .lock()
            .expect("presence lock poisoned")
            .peer_map();
        let listeners = self
            .awareness_listeners
            .lock()
            .expect("listener lock poisoned")
            .snapshot();
        for listener in listeners {
            listener(&peers);
        }
    }
}

enum Command {
    /// The document mutated; `origin` names who caused it.
    LocalUpdate(Vec<u8>, OriginTag),
    /// A presence broadcast built by the facade.
    BroadcastAwareness(RoomEvent),
    ReconnectElapsed,
    Online,
    Offline,
    Destroy,
}

/// Keeps a shared document and its room channel consistent.
///
/// Compose one per open room. `destroy` (or drop) releases the channel,
/// cancels pending reconnects, and detaches every listener; all calls
/// after that are no-ops.
pub struct CollabProvider {
    client_id: ClientId,
    shared: Arc<ProviderShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    destroyed: Arc<AtomicBool>,
    doc_subscription: Mutex<Option<DocumentSubscription>>,
}

impl CollabProvider {
    /// Create a provider and start its driver task.
    ///
    /// Must be called within a tokio runtime. The channel's event stream
    /// must still be takeable; a channel whose events were already taken
    /// yields a provider that never connects (logged as an error).
    pub fn new(
        client_id: ClientId,
        document: Arc<dyn Document>,
        mut channel: Box<dyn Channel>,
        options: ProviderOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ProviderShared {
            status: Mutex::new(ConnectionStatus::Connecting),
            presence: Mutex::new(PresenceRegistry::new(client_id, options.user)),
            timer: Mutex::new(ReconnectTimer::new()),
            status_listeners: Mutex::new(ListenerSet::new()),
            awareness_listeners: Mutex::new(ListenerSet::new()),
        });

        let doc_updates = cmd_tx.clone();
        let doc_subscription = document.subscribe_updates(Box::new(move |update, origin| {
            let _ = doc_updates.send(Command::LocalUpdate(update.to_vec(), origin.clone()));
        }));

        let events = channel.take_events().unwrap_or_else(|| {
            log::error!("Channel event stream already taken; provider will stay disconnected");
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        });

        let driver = Driver {
            channel,
            document,
            connection: ConnectionManager::new(options.reconnect),
            replication: ReplicationProtocol::new(client_id),
            shared: shared.clone(),
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(driver.run(events, cmd_rx));

        Self {
            client_id,
            shared,
            cmd_tx,
            destroyed: Arc::new(AtomicBool::new(false)),
            doc_subscription: Mutex::new(Some(doc_subscription)),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock().expect("status lock poisoned")
    }

    /// Merge a partial update into the local presence state and announce
    /// it. While disconnected the merged state is cached and replayed
    /// automatically once reconnected.
    pub fn set_local_state(&self, patch: StatePatch) {
        if self.is_destroyed() {
            return;
        }
        let event = self
            .shared
            .presence
            .lock()
            .expect("presence lock poisoned")
            .set_local_state(patch);
        let _ = self.cmd_tx.send(Command::BroadcastAwareness(event));
    }

    /// Clear the local presence state, removing our entry on every peer.
    pub fn clear_local_state(&self) {
        if self.is_destroyed() {
            return;
        }
        let event = self
            .shared
            .presence
            .lock()
            .expect("presence lock poisoned")
            .clear_local_state();
        let _ = self.cmd_tx.send(Command::BroadcastAwareness(event));
    }

    /// Snapshot of all remote collaborators (self excluded).
    pub fn get_collaborators(&self) -> Vec<CollaboratorState> {
        self.shared
            .presence
            .lock()
            .expect("presence lock poisoned")
            .collaborators()
    }

    /// Register a connection status listener.
    pub fn on_status_change(
        &self,
        listener: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared
            .status_listeners
            .lock()
            .expect("listener lock poisoned")
            .subscribe(listener)
    }

    pub fn off_status_change(&self, id: ListenerId) -> bool {
        self.shared
            .status_listeners
            .lock()
            .expect("listener lock poisoned")
            .unsubscribe(id)
    }

    /// Register an awareness listener, notified with the full peer map
    /// whenever remote presence changes.
    pub fn on_awareness_change(
        &self,
        listener: impl Fn(&HashMap<ClientId, CollaboratorState>) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared
            .awareness_listeners
            .lock()
            .expect("listener lock poisoned")
            .subscribe(listener)
    }

    pub fn off_awareness_change(&self, id: ListenerId) -> bool {
        self.shared
            .awareness_listeners
            .lock()
            .expect("listener lock poisoned")
            .unsubscribe(id)
    }

    /// Host connectivity signal: the system came online.
    pub fn notify_online(&self) {
        if !self.is_destroyed() {
            let _ = self.cmd_tx.send(Command::Online);
        }
    }

    /// Host connectivity signal: the system went offline.
    pub fn notify_offline(&self) {
        if !self.is_destroyed() {
            let _ = self.cmd_tx.send(Command::Offline);
        }
    }

    /// Tear down: synchronously cancel any pending reconnect and detach
    /// the document listener and listener sets, then tell the driver to
    /// release the channel and exit. Idempotent; every operation after
    /// this is a no-op.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sub) = self.doc_subscription.lock() {
            sub.take();
        }
        self.shared
            .timer
            .lock()
            .expect("timer lock poisoned")
            .cancel();
        let _ = self.cmd_tx.send(Command::Destroy);
        self.shared
            .status_listeners
            .lock()
            .expect("listener lock poisoned")
            .clear();
        self.shared
            .awareness_listeners
            .lock()
            .expect("listener lock poisoned")
            .clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for CollabProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Owns the channel and all protocol state machines. Runs until destroy.
struct Driver {
    channel: Box<dyn Channel>,
    document: Arc<dyn Document>,
    connection: ConnectionManager,
    replication: ReplicationProtocol,
    shared: Arc<ProviderShared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let actions = self.connection.start();
        self.run_actions(actions);

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_channel_event(event),
                command = commands.recv() => match command {
                    Some(Command::Destroy) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        self.shared
            .timer
            .lock()
            .expect("timer lock poisoned")
            .cancel();
        self.channel.unsubscribe();
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Status(status) => {
                let actions = self.connection.on_channel_status(status);
                self.run_actions(actions);
                if matches!(status, ChannelStatus::Closed | ChannelStatus::Errored) {
                    // Leaves cannot be observed while the session is down;
                    // drop remote entries rather than show stale ones.
                    let cleared = self
                        .shared
                        .presence
                        .lock()
                        .expect("presence lock poisoned")
                        .clear_peers();
                    if cleared {
                        self.shared.notify_awareness();
                    }
                }
            }
            ChannelEvent::Broadcast(RoomEvent::Update { update }) => {
                self.replication.apply_remote(self.document.as_ref(), &update);
            }
            ChannelEvent::Broadcast(RoomEvent::Sync { state }) => {
                self.replication.apply_remote(self.document.as_ref(), &state);
            }
            ChannelEvent::Broadcast(RoomEvent::Awareness { client_id, state }) => {
                let changed = self
                    .shared
                    .presence
                    .lock()
                    .expect("presence lock poisoned")
                    .apply_remote(client_id, state);
                if changed {
                    self.shared.notify_awareness();
                }
            }
            ChannelEvent::PresenceJoin(keys) => {
                log::debug!("Presence join: {keys:?}");
                // Newcomers missed every earlier broadcast: hand them the
                // full document state and our presence. Applying a sync is
                // idempotent, so concurrent responders are harmless.
                if self.connection.status() == ConnectionStatus::Connected {
                    self.resync();
                }
            }
            ChannelEvent::PresenceLeave(keys) => {
                let changed = self
                    .shared
                    .presence
                    .lock()
                    .expect("presence lock poisoned")
                    .remove_peers(&keys);
                if changed {
                    self.shared.notify_awareness();
                }
            }
            ChannelEvent::PresenceSync => {
                // Membership was reconciled; let consumers refresh even if
                // individual join/leave events were missed.
                self.shared.notify_awareness();
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::LocalUpdate(update, origin) => {
                let Some(event) = self.replication.outbound_update(&update, &origin) else {
                    return; // Our own remote apply echoing back
                };
                if self.connection.status() != ConnectionStatus::Connected {
                    // Covered by the full-state sync on reconnect
                    log::debug!("Skipping update broadcast while {}", self.connection.status());
                    return;
                }
                if let Err(e) = self.channel.broadcast(&event) {
                    log::warn!("Update broadcast failed: {e}");
                }
            }
            Command::BroadcastAwareness(event) => {
                if self.connection.status() != ConnectionStatus::Connected {
                    return; // Cached in the registry, replayed on reconnect
                }
                if let Err(e) = self.channel.broadcast(&event) {
                    log::warn!("Awareness broadcast failed: {e}");
                }
            }
            Command::ReconnectElapsed => {
                let actions = self.connection.on_reconnect_timer();
                self.run_actions(actions);
            }
            Command::Online => {
                let actions = self.connection.on_online();
                self.run_actions(actions);
            }
            Command::Offline => {
                let actions = self.connection.on_offline();
                self.run_actions(actions);
                // Release the session; the transport cannot carry it while
                // the host is offline, and peers should see us leave.
                self.channel.unsubscribe();
                let cleared = self
                    .shared
                    .presence
                    .lock()
                    .expect("presence lock poisoned")
                    .clear_peers();
                if cleared {
                    self.shared.notify_awareness();
                }
            }
            Command::Destroy => unreachable!("Destroy is handled in the run loop"),
        }
    }

    fn run_actions(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::OpenChannel => self.channel.subscribe(),
                ConnectionAction::ArmReconnect(delay) => {
                    let tx = self.cmd_tx.clone();
                    self.shared
                        .timer
                        .lock()
                        .expect("timer lock poisoned")
                        .arm(delay, move || {
                            let _ = tx.send(Command::ReconnectElapsed);
                        });
                }
                ConnectionAction::CancelReconnect => self
                    .shared
                    .timer
                    .lock()
                    .expect("timer lock poisoned")
                    .cancel(),
                ConnectionAction::NotifyStatus(status) => {
                    self.shared
                        .notify_status(ConnectionEvent::StatusChanged(status));
                }
                ConnectionAction::NotifyReconnectFailed => {
                    self.shared.notify_status(ConnectionEvent::ReconnectFailed);
                }
                ConnectionAction::RunResync => self.resync(),
            }
        }
    }

    /// Post-connect recovery: announce the full document state so late
    /// joiners converge, and replay the cached presence state the
    /// transport forgot during the drop.
    fn resync(&mut self) {
        let sync = self.replication.full_sync_event(self.document.as_ref());
        if let Err(e) = self.channel.broadcast(&sync) {
            log::warn!("Full-state sync broadcast failed: {e}");
        }

        let replay = self
            .shared
            .presence
            .lock()
            .expect("presence lock poisoned")
            .replay_event();
        if let Some(event) = replay {
            if let Err(e) = self.channel.broadcast(&event) {
                log::warn!("Presence replay failed: {e}");
            }
        }
    }
}
