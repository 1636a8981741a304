//! RelayNode lifecycle against the loopback engine
use peerprobe_integration_tests::integration::TestHarness;
use peerprobe_lib::ports::{PEER_A_PORT_RANGE, PEER_B_PORT_RANGE};
use peerprobe_node::HarnessError;
use std::time::Duration;

#[tokio::test]
async fn test_second_relay_on_same_port_fails() {
    let harness = TestHarness::new();
    let first = harness.relay(33445).unwrap();
    first.start().await.unwrap();

    let err = harness.relay(33445).err().unwrap();
    match err {
        HarnessError::Initialization { component, reason } => {
            assert!(component.contains("33445"));
            assert!(reason.contains("no free port"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }

    first.stop().await.unwrap();
    let again = harness.relay(33445).unwrap();
    again.start().await.unwrap();
    again.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    relay.start().await.unwrap();
    let err = relay.start().await.unwrap_err();
    assert!(matches!(err, HarnessError::AlreadyRunning(_)));
    assert!(relay.is_running());
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_unhealthy_relay_fails_verification() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    harness.network().set_relay_healthy("127.0.0.1", 33445, false);

    let err = relay.start().await.unwrap_err();
    assert!(matches!(err, HarnessError::Verification { .. }));
    assert!(!relay.is_running());
    // The engine is released on the spot, not when the node is dropped
    assert!(!harness.network().is_port_bound(33445));
    assert_eq!(harness.network().relay_count(), 0);
    assert!(matches!(relay.start().await, Err(HarnessError::NotRunning(_))));
    relay.stop().await.unwrap();

    let replacement = harness.relay(33445).unwrap();
    harness.network().set_relay_healthy("127.0.0.1", 33445, true);
    replacement.start().await.unwrap();
    replacement.stop().await.unwrap();
}

#[tokio::test]
async fn test_wait_for_peers_sees_connected_peers() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    relay.start().await.unwrap();

    let alice = harness.peer("Alice", PEER_A_PORT_RANGE).unwrap();
    let bob = harness.peer("Bob", PEER_B_PORT_RANGE).unwrap();
    harness.connect(&alice, &relay).await.unwrap();
    harness.connect(&bob, &relay).await.unwrap();

    let observed = relay
        .wait_for_peers(2, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(observed, 2);

    let metrics = relay.metrics();
    assert_eq!(metrics.active_peers, 2);
    assert_eq!(metrics.connections_served, 2);
    assert!(metrics.packets_processed > 0);

    let status = relay.status();
    assert!(status.running);
    assert_eq!(status.public_key, relay.public_key().to_hex());
    assert!(relay.health_status().contains("2 active peers"));

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn test_peers_drop_off_when_relay_goes_down() {
    let harness = TestHarness::new();
    let relay = harness.relay(33445).unwrap();
    relay.start().await.unwrap();
    let alice = harness.peer("Alice", PEER_A_PORT_RANGE).unwrap();
    harness.connect(&alice, &relay).await.unwrap();

    relay.stop().await.unwrap();
    for _ in 0..100 {
        if !alice.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!alice.is_connected());
    alice.stop().await.unwrap();
}
