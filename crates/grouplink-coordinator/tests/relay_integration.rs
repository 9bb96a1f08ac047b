//! Integration tests for the coordinator over real loopback sockets.
//!
//! # Purpose
//!
//! The unit tests in `infrastructure::session` record outbound envelopes in a
//! `RecordingSink`.  These tests use the production `Outbox` instead: each
//! simulated member is a real `Listener` whose inbound envelopes land in a
//! channel, so every relay actually crosses TCP.
//!
//! ```text
//! fake member A ──Join──►  coordinator  ──SyncSet──► A
//! fake member B ──Join──►              ──Join(B)──► A
//!                                      ──SyncSet{A}─► B
//! ```

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use grouplink_coordinator::{CoordinatorSession, CoordinatorState};
use grouplink_core::adhoc::loopback::LoopbackNetwork;
use grouplink_core::config::GroupLinkConfig;
use grouplink_core::net::mock::RecordingSink;
use grouplink_core::net::{
    deliver, ChannelDispatcher, InboundEnvelope, Listener, ListenerHandle,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_ENVELOPE_BYTES,
};
use grouplink_core::{Device, Envelope, EnvelopeKind, SessionEvent, Target};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

// ── Helpers ───────────────────────────────────────────────────────────────────

struct FakeMember {
    device: Device,
    _listener: ListenerHandle,
    inbox: mpsc::Receiver<InboundEnvelope>,
}

impl FakeMember {
    async fn start(id: &str) -> Self {
        let (dispatcher, inbox) = ChannelDispatcher::channel(16);
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_MAX_ENVELOPE_BYTES,
            Arc::new(dispatcher),
        )
        .await
        .expect("bind fake member");
        // Announce the wildcard host, as a real member does.
        let port = listener.local_addr().port();
        let device = Device::new(id, format!("member-{id}"))
            .with_endpoint(SocketAddr::new([0, 0, 0, 0].into(), port));
        Self {
            device,
            _listener: listener,
            inbox,
        }
    }

    async fn join(&self, coordinator: SocketAddr) {
        let envelope = Envelope::join(&self.device, &self.device).unwrap();
        assert_ok!(deliver(coordinator, &envelope, DEFAULT_CONNECT_TIMEOUT).await);
    }

    async fn next(&mut self) -> Envelope {
        timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for relay")
            .expect("inbox closed")
            .envelope
    }
}

fn loopback_config() -> GroupLinkConfig {
    let mut config = GroupLinkConfig::default();
    config.network.bind_address = "127.0.0.1".parse().unwrap();
    config.network.coordinator_port = 0;
    config
}

async fn start_coordinator() -> (CoordinatorSession, mpsc::Receiver<SessionEvent>, SocketAddr) {
    let network = LoopbackNetwork::new();
    let transport = Arc::new(network.transport("S", "server"));
    let (session, mut events) = CoordinatorSession::open(transport, loopback_config());
    let bound = session
        .register_as_coordinator("it", BTreeMap::new())
        .await
        .expect("register");
    let ready = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(ready, SessionEvent::GroupReady { .. }));
    (session, events, bound)
}

async fn expect_joined(events: &mut mpsc::Receiver<SessionEvent>) -> Device {
    match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
        SessionEvent::MemberJoined(device) => device,
        other => panic!("expected MemberJoined, got {other:?}"),
    }
}

// ── Relay tests ───────────────────────────────────────────────────────────────

/// Two members join one after the other; each ends up knowing the other.
#[tokio::test]
async fn test_second_join_is_relayed_to_first_member_and_synced_to_joiner() {
    // Arrange
    let (session, mut events, bound) = start_coordinator().await;
    let mut a = FakeMember::start("A").await;
    let mut b = FakeMember::start("B").await;

    // Act: A joins.
    a.join(bound).await;
    expect_joined(&mut events).await;

    // Assert: A's sync set is empty.
    let sync_a = a.next().await;
    assert_eq!(sync_a.kind, EnvelopeKind::SyncSet);
    assert!(sync_a.devices().unwrap().is_empty());

    // Act: B joins.
    b.join(bound).await;
    expect_joined(&mut events).await;

    // Assert: A hears Join(B) and B's sync set holds A.
    let relay = a.next().await;
    assert_eq!(relay.kind, EnvelopeKind::Join);
    assert_eq!(relay.device().unwrap().id, b.device.id);
    assert_eq!(relay.sender_id.as_str(), "S");

    let sync_b = b.next().await;
    assert_eq!(sync_b.kind, EnvelopeKind::SyncSet);
    let ids: Vec<_> = sync_b.devices().unwrap().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![a.device.id.clone()]);

    session.disconnect().await;
}

/// A Leave reaches every remaining member and only them.
#[tokio::test]
async fn test_leave_is_relayed_to_remaining_members() {
    // Arrange
    let (session, mut events, bound) = start_coordinator().await;
    let mut a = FakeMember::start("A").await;
    let mut b = FakeMember::start("B").await;
    a.join(bound).await;
    expect_joined(&mut events).await;
    let _ = a.next().await; // SyncSet
    b.join(bound).await;
    expect_joined(&mut events).await;
    let _ = a.next().await; // Join(B)
    let _ = b.next().await; // SyncSet

    // Act
    let leave = Envelope::leave(&a.device, &a.device).unwrap();
    assert_ok!(deliver(bound, &leave, DEFAULT_CONNECT_TIMEOUT).await);

    // Assert
    let relay = b.next().await;
    assert_eq!(relay.kind, EnvelopeKind::Leave);
    assert_eq!(relay.device().unwrap().id, a.device.id);
    assert!(
        timeout(Duration::from_millis(200), a.inbox.recv()).await.is_err(),
        "the leaver must not hear its own Leave"
    );
    let ids: Vec<_> = session.registry().await.into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![b.device.id.clone()]);

    session.disconnect().await;
}

/// Broadcast data from the coordinator reaches every member.
#[tokio::test]
async fn test_broadcast_data_reaches_every_member() {
    let (session, mut events, bound) = start_coordinator().await;
    let mut a = FakeMember::start("A").await;
    let mut b = FakeMember::start("B").await;
    a.join(bound).await;
    expect_joined(&mut events).await;
    b.join(bound).await;
    expect_joined(&mut events).await;

    session
        .send_data(Target::Broadcast, b"hello group".to_vec())
        .await
        .expect("send");

    for member in [&mut a, &mut b] {
        let data = loop {
            let envelope = member.next().await;
            if envelope.kind == EnvelopeKind::Data {
                break envelope;
            }
        };
        assert_eq!(data.payload, b"hello group".to_vec());
    }
    session.disconnect().await;
}

/// Envelopes arriving after disconnect are not processed.
#[tokio::test]
async fn test_disconnected_coordinator_stops_listening() {
    let (session, _events, bound) = start_coordinator().await;

    session.disconnect().await;

    assert_eq!(session.state(), CoordinatorState::Idle);
    let a = FakeMember::start("A").await;
    let envelope = Envelope::join(&a.device, &a.device).unwrap();
    assert!(deliver(bound, &envelope, DEFAULT_CONNECT_TIMEOUT).await.is_err());
}

/// Joins arriving on many connections at once are applied one at a time:
/// every member hears about every other member exactly once, either as a
/// relayed Join or inside its own SyncSet.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_produce_one_consistent_registry() {
    const MEMBERS: u16 = 24;

    // Arrange
    let network = LoopbackNetwork::new();
    let sink = RecordingSink::new();
    let (session, mut events) = CoordinatorSession::with_sink(
        Arc::new(network.transport("S", "server")),
        loopback_config(),
        Arc::new(sink.clone()),
    );
    let bound = assert_ok!(session.register_as_coordinator("it", BTreeMap::new()).await);
    let ready = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(ready, SessionEvent::GroupReady { .. }));
    let members: Vec<Device> = (0..MEMBERS)
        .map(|i| {
            Device::new(format!("M{i:02}"), format!("member-{i}"))
                .with_endpoint(SocketAddr::new([0, 0, 0, 0].into(), 41000 + i))
        })
        .collect();

    // Act
    let mut joins = JoinSet::new();
    for device in members.clone() {
        joins.spawn(async move {
            let envelope = Envelope::join(&device, &device).unwrap();
            deliver(bound, &envelope, DEFAULT_CONNECT_TIMEOUT).await
        });
    }
    while let Some(result) = joins.join_next().await {
        assert_ok!(result.expect("join task panicked"));
    }
    for _ in 0..MEMBERS {
        expect_joined(&mut events).await;
    }

    // Assert
    let n = usize::from(MEMBERS);
    assert_eq!(session.registry().await.len(), n);
    let sent = sink.sent();
    let count = |kind: EnvelopeKind| sent.iter().filter(|s| s.envelope.kind == kind).count();
    assert_eq!(count(EnvelopeKind::Join), n * (n - 1) / 2);
    assert_eq!(count(EnvelopeKind::SyncSet), n);

    let by_port: HashMap<u16, String> = members
        .iter()
        .filter_map(|d| Some((d.endpoint?.port(), d.id.to_string())))
        .collect();
    let mut heard: HashMap<String, Vec<String>> = HashMap::new();
    for s in &sent {
        let receiver = by_port[&s.endpoint.port()].clone();
        let learned = heard.entry(receiver).or_default();
        match s.envelope.kind {
            EnvelopeKind::Join => learned.push(s.envelope.device().unwrap().id.to_string()),
            EnvelopeKind::SyncSet => learned.extend(
                s.envelope
                    .devices()
                    .unwrap()
                    .into_iter()
                    .map(|d| d.id.to_string()),
            ),
            _ => {}
        }
    }
    for device in &members {
        let mut learned = heard.remove(device.id.as_str()).unwrap_or_default();
        learned.sort();
        let others: Vec<String> = members
            .iter()
            .filter(|d| d.id != device.id)
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(learned, others, "what {} heard about the group", device.id);
    }

    session.disconnect().await;
}
