//! TestPeer behaviour against a live loopback relay
use peerprobe_integration_tests::integration::TestHarness;
use peerprobe_lib::ports::{OTHER_PEERS_PORT_RANGE, PEER_A_PORT_RANGE};
use peerprobe_lib::ContactStatus;
use peerprobe_node::{HarnessError, PeerConfig, PeerState};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_wait_for_connection_times_out_promptly() {
    let harness = TestHarness::new();
    let peer = harness.peer("Loner", PEER_A_PORT_RANGE).unwrap();
    peer.start().unwrap();

    let started = Instant::now();
    let err = peer
        .wait_for_connection(Duration::from_millis(50))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    match &err {
        HarnessError::Timeout {
            operation,
            actor,
            timeout,
        } => {
            assert_eq!(operation, "connection");
            assert_eq!(actor, "Loner");
            assert_eq!(*timeout, Duration::from_millis(50));
        }
        other => panic!("expected a timeout, got {other}"),
    }
    assert!(waited >= Duration::from_millis(50));
    assert!(waited < Duration::from_millis(150), "waited {:?}", waited);
    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_contact_statuses_follow_connectivity() {
    let harness = TestHarness::new();
    let (relay, alice, bob) = harness.connected_pair(33445).await.unwrap();

    let online = |peer: &peerprobe_node::TestPeer| {
        peer.contacts()
            .values()
            .all(|relation| relation.status == ContactStatus::Online)
    };
    for _ in 0..100 {
        if online(&alice) && online(&bob) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(online(&alice) && online(&bob));
    assert!(alice.contacts().values().all(|r| r.last_seen.is_some()));

    for peer in [&alice, &bob] {
        peer.stop().await.unwrap();
    }
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_freezes_metrics() {
    let harness = TestHarness::new();
    let (relay, alice, bob) = harness.connected_pair(33445).await.unwrap();
    let bob_id = alice
        .contacts()
        .values()
        .find(|r| r.public_key == bob.public_key())
        .unwrap()
        .contact_id;
    alice.send_message(bob_id, "before shutdown").unwrap();
    bob.wait_for_message(Duration::from_secs(2)).await.unwrap();

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    relay.stop().await.unwrap();

    let alice_before = alice.metrics();
    let bob_before = bob.metrics();
    let relay_before = relay.metrics();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(alice.metrics(), alice_before);
    assert_eq!(bob.metrics(), bob_before);
    assert_eq!(relay.metrics(), relay_before);
    assert_eq!(alice.state(), PeerState::Stopped);
    assert!(!alice.is_connected());
}

#[tokio::test]
async fn test_accessors_are_independent_copies() {
    let harness = TestHarness::new();
    let (relay, alice, bob) = harness.connected_pair(33445).await.unwrap();

    let mut contacts = alice.contacts();
    contacts.clear();
    let mut metrics = alice.metrics();
    metrics.messages_sent += 10;
    metrics.contact_requests_sent = 0;

    assert_eq!(alice.contacts().len(), 1);
    assert_eq!(alice.metrics().messages_sent, 0);
    assert_eq!(alice.metrics().contact_requests_sent, 1);

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_status_snapshot_of_connected_peer() {
    let harness = TestHarness::new();
    let (relay, alice, bob) = harness.connected_pair(33445).await.unwrap();
    let bob_id = alice
        .contacts()
        .values()
        .find(|r| r.public_key == bob.public_key())
        .unwrap()
        .contact_id;
    alice.send_message(bob_id, "status check").unwrap();
    bob.wait_for_message(Duration::from_secs(2)).await.unwrap();

    // Off the runtime thread, so a status call that never returns fails here
    let snapshot = tokio::time::timeout(
        Duration::from_secs(3),
        tokio::task::spawn_blocking(move || {
            let status = alice.status();
            (alice, status)
        }),
    )
    .await
    .expect("status() did not return")
    .unwrap();
    let (alice, status) = snapshot;

    assert_eq!(status.name, "Alice");
    assert_eq!(status.public_key, alice.public_key().to_hex());
    assert_eq!(status.port, alice.port());
    assert_eq!(status.state, PeerState::Connected);
    assert!(status.connected);
    assert_eq!(status.contacts, 1);
    assert_eq!(status.metrics.messages_sent, 1);
    assert_eq!(status.metrics.contact_requests_sent, 1);

    let bob_status = bob.status();
    assert_eq!(bob_status.contacts, 1);
    assert_eq!(bob_status.metrics.messages_received, 1);

    alice.stop().await.unwrap();
    assert_eq!(alice.status().state, PeerState::Stopped);
    assert!(!alice.status().connected);
    bob.stop().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let harness = TestHarness::new();
    let never_started = harness.peer("Idle", PEER_A_PORT_RANGE).unwrap();
    never_started.stop().await.unwrap();
    never_started.stop().await.unwrap();

    let (relay, alice, bob) = harness.connected_pair(33445).await.unwrap();
    alice.stop().await.unwrap();
    alice.stop().await.unwrap();

    let err = alice
        .send_contact_request(&bob.public_key(), "again")
        .unwrap_err();
    assert!(matches!(err, HarnessError::NotRunning(_)));
    let err = alice
        .wait_for_message(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::NotRunning(_)));

    bob.stop().await.unwrap();
    relay.stop().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_isolation_emits_connection_events() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    relay.start().await.unwrap();
    let peer = harness.peer("Carol", OTHER_PEERS_PORT_RANGE).unwrap();
    harness.connect(&peer, &relay).await.unwrap();

    harness.network().isolate_peer(&peer.public_key());
    for _ in 0..100 {
        if !peer.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!peer.is_connected());
    assert_eq!(peer.state(), PeerState::Disconnected);

    harness.network().restore_peer(&peer.public_key());
    peer.wait_for_connection(Duration::from_secs(1)).await.unwrap();

    let events = peer.drain_connection_events().await;
    let flips: Vec<bool> = events.iter().map(|event| event.connected).collect();
    assert_eq!(flips, vec![true, false, true]);
    assert_eq!(peer.metrics().connection_events, 3);
    assert!(peer.drain_connection_events().await.is_empty());

    peer.stop().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_queue_drops_and_counts() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    relay.start().await.unwrap();

    let mut config = PeerConfig::new("Alice", PEER_A_PORT_RANGE);
    config.queue_capacity = 1;
    let alice = harness.peer_with(config).unwrap();
    let bob = harness
        .peer("Bob", peerprobe_lib::ports::PEER_B_PORT_RANGE)
        .unwrap();
    harness.connect(&alice, &relay).await.unwrap();
    harness.connect(&bob, &relay).await.unwrap();

    let alice_id = bob.accept_contact_request(&alice.public_key()).unwrap();
    alice.accept_contact_request(&bob.public_key()).unwrap();

    for text in ["one", "two", "three"] {
        bob.send_message(alice_id, text).unwrap();
    }

    let first = alice.wait_for_message(Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.text, "one");
    for _ in 0..100 {
        if alice.metrics().messages_received == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let metrics = alice.metrics();
    assert_eq!(metrics.messages_received, 3);
    assert_eq!(metrics.dropped_events, 2);

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    relay.stop().await.unwrap();
}
