//! End-to-end replication tests: providers wired through the in-process
//! hub, exercising convergence, loop breaking, reconnection, and the
//! malformed-message path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use boardsync::{
    ClientId, CollabProvider, ConnectionEvent, ConnectionStatus, Channel, Document, HubConfig,
    MemoryDocument, OriginTag, ProviderOptions, ReconnectConfig, RoomEvent, RoomHub, UserProfile,
};

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_attempts: 5,
        jitter: false,
    }
}

fn spawn_provider_with(
    hub: &RoomHub,
    room: &str,
    client_id: ClientId,
    name: &str,
    reconnect: ReconnectConfig,
) -> (CollabProvider, Arc<MemoryDocument>) {
    let document = Arc::new(MemoryDocument::new());
    let channel = Box::new(hub.channel(room, client_id));
    let options = ProviderOptions::new(UserProfile::new(name)).with_reconnect(reconnect);
    let provider = CollabProvider::new(client_id, document.clone(), channel, options);
    (provider, document)
}

fn spawn_provider(hub: &RoomHub, room: &str, name: &str) -> (CollabProvider, Arc<MemoryDocument>) {
    spawn_provider_with(hub, room, ClientId::generate(), name, fast_reconnect())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}

#[tokio::test]
async fn test_two_providers_converge() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    doc_a.insert(b"rect-1".to_vec(), &OriginTag::local());
    doc_b.insert(b"note-1".to_vec(), &OriginTag::local());
    settle().await;

    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());
    assert_eq!(doc_a.chunk_count(), 2);

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    settle().await;

    for chunk in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
        doc_a.insert(chunk, &OriginTag::local());
    }
    settle().await;

    // Bob joins after the fact: no incremental deltas were ever sent to
    // him, only the full-state sync can catch him up.
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    assert_eq!(doc_b.chunk_count(), 3);
    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_duplicate_delivery_converges() {
    // At-least-once transport: every frame delivered twice.
    let hub = RoomHub::with_config(HubConfig { echo: false, duplicate: true });
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    doc_a.insert(b"x".to_vec(), &OriginTag::local());
    doc_b.insert(b"y".to_vec(), &OriginTag::local());
    settle().await;

    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());
    // Idempotent apply: duplicates add nothing
    assert_eq!(doc_a.chunk_count(), 2);
    assert_eq!(doc_b.chunk_count(), 2);

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_no_feedback_loop_with_echo() {
    // Echo transport: every sender receives its own broadcasts back.
    let hub = RoomHub::with_config(HubConfig { echo: true, duplicate: false });
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    settle().await;
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    doc_a.insert(b"shape".to_vec(), &OriginTag::local());
    settle().await;
    let after_edit = hub.stats("board-1").unwrap().messages_sent;
    settle().await;

    // No further traffic once the edit has propagated: a rebroadcast
    // loop would keep the counter climbing.
    assert_eq!(hub.stats("board-1").unwrap().messages_sent, after_edit);
    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_malformed_messages_do_not_kill_session() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    // Garbage at the frame level: dropped at the hub boundary
    hub.inject_raw("board-1", &[0x00, 0xFF, 0xAA, 0x55]);

    // Well-formed frame carrying an update the document cannot decode:
    // dropped at the apply boundary
    let mut rogue = hub.channel("board-1", ClientId::generate());
    let _events = rogue.take_events();
    rogue.subscribe();
    rogue
        .broadcast(&RoomEvent::Update { update: vec![0xDE, 0xAD] })
        .unwrap();
    settle().await;

    assert_eq!(provider_a.status(), ConnectionStatus::Connected);
    assert_eq!(provider_b.status(), ConnectionStatus::Connected);

    // The session still replicates
    doc_a.insert(b"survivor".to_vec(), &OriginTag::local());
    settle().await;
    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_offline_edits_recovered_on_reconnect() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    // Drop Alice; both sides keep editing during the outage
    hub.drop_member("board-1", provider_a.client_id());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(provider_a.status(), ConnectionStatus::Disconnected);

    doc_a.insert(b"while-offline-a".to_vec(), &OriginTag::local());
    doc_b.insert(b"while-offline-b".to_vec(), &OriginTag::local());

    // Backoff timer (10ms base) resubscribes; the mutual full-state sync
    // on rejoin recovers both directions.
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(provider_a.status(), ConnectionStatus::Connected);
    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());
    assert_eq!(doc_a.chunk_count(), 2);

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_exhausted_reconnect_emits_terminal_signal() {
    let hub = RoomHub::new();
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(5),
        max_attempts: 2,
        jitter: false,
    };
    let (provider, _doc) =
        spawn_provider_with(&hub, "board-1", ClientId::generate(), "Alice", reconnect);
    settle().await;

    let events: Arc<Mutex<Vec<ConnectionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    provider.on_status_change(move |event| {
        events2.lock().unwrap().push(*event);
    });

    hub.refuse_subscriptions(10);
    hub.drop_member("board-1", provider.client_id());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let events = events.lock().unwrap();
    assert!(
        events.contains(&ConnectionEvent::ReconnectFailed),
        "expected terminal reconnect signal, got {events:?}"
    );
    assert_eq!(provider.status(), ConnectionStatus::Disconnected);
    assert!(hub.members("board-1").is_empty());

    drop(events);
    provider.destroy();
}

#[tokio::test]
async fn test_offline_online_signals() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-1", "Bob");
    settle().await;

    provider_a.notify_offline();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(provider_a.status(), ConnectionStatus::Disconnected);

    // No reconnect while offline, even well past the backoff delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider_a.status(), ConnectionStatus::Disconnected);

    provider_a.notify_online();
    settle().await;
    assert_eq!(provider_a.status(), ConnectionStatus::Connected);

    // Still replicating after the cycle
    doc_a.insert(b"back".to_vec(), &OriginTag::local());
    settle().await;
    assert_eq!(doc_a.encode_full_state(), doc_b.encode_full_state());

    provider_a.destroy();
    provider_b.destroy();
}

#[tokio::test]
async fn test_room_isolation() {
    let hub = RoomHub::new();
    let (provider_a, doc_a) = spawn_provider(&hub, "board-1", "Alice");
    let (provider_b, doc_b) = spawn_provider(&hub, "board-2", "Bob");
    settle().await;

    doc_a.insert(b"only-board-1".to_vec(), &OriginTag::local());
    settle().await;

    assert_eq!(doc_b.chunk_count(), 0);
    assert_ne!(doc_a.encode_full_state(), doc_b.encode_full_state());

    provider_a.destroy();
    provider_b.destroy();
}
