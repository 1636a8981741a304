//! Failure paths: retries, deadlines, lost messages, port conflicts
use futures::future::join_all;
use peerprobe_integration_tests::integration::{TestHarness, TestScenarios};
use peerprobe_lib::StepStatus;
use peerprobe_node::{
    EngineFactory, HarnessError, ManualClock, RelayOptions, TestConfig, Workflow,
};
use peerprobe_lib::PortRange;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_flaky_bootstrap_is_retried() {
    let (_harness, outcome) = TestScenarios::flaky_bootstrap_run(2, 3).await;
    assert!(outcome.results.passed(), "report:\n{}", outcome.report);
}

#[tokio::test]
async fn test_bootstrap_retries_exhausted() {
    let (harness, outcome) = TestScenarios::flaky_bootstrap_run(10, 2).await;
    let results = &outcome.results;

    assert!(!results.passed());
    assert_eq!(results.steps[0].status, StepStatus::Failed);
    let error = results.error_details.as_deref().unwrap();
    assert!(error.contains("Peer Setup"), "{error}");
    assert!(error.contains("failed after 2 attempts"), "{error}");
    assert!(outcome.report.contains("Final status: FAILED"));

    // Cleanup released every component
    assert_eq!(harness.network().peer_count(), 0);
    assert_eq!(harness.network().relay_count(), 0);
}

#[tokio::test]
async fn test_overall_deadline_stops_later_phases() {
    let clock = Arc::new(ManualClock::new());
    let harness = TestHarness::with_clock(clock.clone());
    let config = TestConfig {
        overall_timeout: Duration::from_secs(1),
        relay_settle_delay: Duration::from_secs(2),
        ..TestHarness::fast_config()
    };

    let outcome = TestScenarios::run(&harness, config).await;
    let results = &outcome.results;

    assert!(!results.passed());
    assert_eq!(results.steps[0].status, StepStatus::TimedOut);
    assert!(results
        .error_details
        .as_deref()
        .unwrap()
        .contains("before phase 'Peer Setup'"));
    assert!(results.total_duration >= Duration::from_secs(2));
    assert!(outcome.report.contains("[TIMED OUT] Complete Protocol Test"));
    assert_eq!(harness.network().relay_count(), 0);
    assert_eq!(harness.network().peer_count(), 0);
}

#[tokio::test]
async fn test_lost_messages_time_out() {
    let harness = TestHarness::new();
    harness.network().set_drop_rate(1.0);
    let config = TestConfig {
        message_timeout: Duration::from_millis(200),
        ..TestHarness::fast_config()
    };

    let outcome = TestScenarios::run(&harness, config).await;
    let results = &outcome.results;

    assert_eq!(results.steps[0].status, StepStatus::TimedOut);
    let error = results.error_details.as_deref().unwrap();
    assert!(error.contains("Message Exchange"), "{error}");
    assert!(error.contains("Alice"), "{error}");
    assert!(results.steps[0].metrics.is_none());
}

#[tokio::test]
async fn test_occupied_relay_port_fails_first_phase() {
    let harness = TestHarness::new();
    let squatter = harness
        .network()
        .create_relay(RelayOptions {
            address: "127.0.0.1".to_string(),
            port_range: PortRange::single(33445),
            udp_enabled: true,
            ipv6_enabled: false,
        })
        .unwrap();

    let mut workflow = Workflow::new(
        TestHarness::fast_config(),
        Arc::new(harness.network().clone()),
        harness.clock(),
    );
    let err = workflow.execute(None).await.unwrap_err();

    assert_eq!(err.phase(), Some("Network Initialization"));
    assert!(matches!(
        err,
        HarnessError::Phase { ref source, .. } if matches!(**source, HarnessError::Initialization { .. })
    ));
    assert!(workflow.completed_phases().is_empty());
    assert!(workflow.peer_a().is_none());
    drop(squatter);
    assert!(!harness.network().is_port_bound(33445));
}

#[tokio::test]
async fn test_invalid_config_creates_nothing() {
    let harness = TestHarness::new();
    let config = TestConfig {
        retry_attempts: 0,
        ..TestHarness::fast_config()
    };

    let outcome = TestScenarios::run(&harness, config).await;
    assert_eq!(outcome.results.steps[0].name, "Configuration Validation");
    assert_eq!(harness.network().relay_count(), 0);
    assert!(!harness.network().is_port_bound(33445));
}

#[tokio::test]
async fn test_independent_runs_on_separate_networks() {
    let runs = (0..3).map(|_| TestScenarios::full_protocol_run());
    let outcomes = join_all(runs).await;
    for outcome in outcomes {
        assert!(outcome.results.passed(), "report:\n{}", outcome.report);
    }
}
