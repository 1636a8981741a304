use peerprobe_lib::Results;
use peerprobe_node::{Orchestrator, TestConfig};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::integration::{RunInvariants, TestHarness};

/// Upper bound on a single orchestrator run before the test fails
pub const SCENARIO_LIMIT: Duration = Duration::from_secs(30);

/// What a scenario run leaves behind for assertions
pub struct ScenarioOutcome {
    pub results: Results,
    pub report: String,
}

/// Common orchestrator runs
pub struct TestScenarios;

impl TestScenarios {
    /// Runs the orchestrator once on `harness` and checks the result invariants
    pub async fn run(harness: &TestHarness, config: TestConfig) -> ScenarioOutcome {
        let (orchestrator, sink) = harness.orchestrator(config);
        let results = Self::run_bounded(orchestrator).await;

        let violations = RunInvariants::check_all(&results);
        assert!(violations.is_empty(), "Result invariants violated: {:?}", violations);

        ScenarioOutcome {
            results,
            report: sink.contents(),
        }
    }

    /// Runs the orchestrator on its own thread and runtime, so a run that
    /// blocks its thread still fails after `SCENARIO_LIMIT`
    async fn run_bounded(mut orchestrator: Orchestrator) -> Results {
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("scenario runtime");
            let results = runtime.block_on(orchestrator.run_tests()).clone();
            let _ = tx.send(results);
        });

        match tokio::time::timeout(SCENARIO_LIMIT, rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => panic!("scenario thread exited without results"),
            Err(_) => panic!("scenario did not finish within {:?}", SCENARIO_LIMIT),
        }
    }

    /// The full relay + Alice + Bob scenario with fast timings
    pub async fn full_protocol_run() -> ScenarioOutcome {
        let harness = TestHarness::new();
        Self::run(&harness, TestHarness::fast_config()).await
    }

    /// Runs the scenario with the first `failures` bootstraps failing
    pub async fn flaky_bootstrap_run(failures: u32, attempts: u32) -> (TestHarness, ScenarioOutcome) {
        let harness = TestHarness::new();
        harness.network().fail_next_bootstraps(failures);
        let config = TestConfig {
            retry_attempts: attempts,
            ..TestHarness::fast_config()
        };
        let outcome = Self::run(&harness, config).await;
        (harness, outcome)
    }
}
