use peerprobe_lib::{Results, StepResult, StepStatus};
use std::fs;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use crate::config::TestConfig;
use crate::engine::EngineFactory;
use crate::error::HarnessError;
use crate::timing::TimeProvider;
use crate::workflow::Workflow;

const LABEL: &str = "orchestrator";

pub const CONFIG_STEP: &str = "Configuration Validation";
pub const PROTOCOL_STEP: &str = "Complete Protocol Test";

/// Runs the workflow under the overall deadline, tracks each step and
/// writes the final report.
pub struct Orchestrator {
    config: TestConfig,
    factory: Arc<dyn EngineFactory>,
    clock: Arc<dyn TimeProvider>,
    output: Box<dyn Write + Send>,
    results: Results,
}

impl Orchestrator {
    pub fn new(
        config: TestConfig,
        factory: Arc<dyn EngineFactory>,
        clock: Arc<dyn TimeProvider>,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            config,
            factory,
            clock,
            output,
            results: Results::new(),
        }
    }

    pub fn validate_configuration(&self) -> Result<(), HarnessError> {
        self.config.validate()?;
        Ok(())
    }

    /// One complete run. The report is always written, whatever the outcome.
    pub async fn run_tests(&mut self) -> &Results {
        self.results = Results::new();
        let started = self.clock.now();

        let error = match self.validate_configuration() {
            Err(e) => {
                log_error!(LABEL, "{}", e);
                self.results.record(StepResult {
                    name: CONFIG_STEP.to_string(),
                    status: StepStatus::Failed,
                    duration: self.clock.elapsed_since(started),
                    error: Some(e.to_string()),
                    metrics: None,
                });
                Some(e.to_string())
            }
            Ok(()) => self.run_workflow().await.err().map(|e| e.to_string()),
        };

        self.results
            .finalize(self.clock.elapsed_since(started), error);
        log_info!(
            LABEL,
            "Run finished: {} ({} of {} steps passed)",
            self.results.final_status.label(),
            self.results.passed_steps,
            self.results.total_steps
        );
        self.write_report();
        &self.results
    }

    async fn run_workflow(&mut self) -> Result<(), HarnessError> {
        let deadline = self.clock.now() + self.config.overall_timeout;
        let mut workflow = Workflow::new(
            self.config.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.clock),
        );

        let outcome = self
            .execute_with_step_tracking(PROTOCOL_STEP, async {
                workflow.execute(Some(deadline)).await?;
                Ok::<_, HarnessError>(workflow.final_metrics().cloned())
            })
            .await;

        if let Some(warning) = workflow.take_cleanup_warning() {
            self.results.add_warning(warning.to_string());
        }
        outcome
    }

    /// Awaits `step`, records its result, and returns its error unchanged.
    pub async fn execute_with_step_tracking<F>(
        &mut self,
        name: &str,
        step: F,
    ) -> Result<(), HarnessError>
    where
        F: Future<Output = Result<Option<serde_json::Value>, HarnessError>>,
    {
        log_info!(LABEL, "Starting step: {}", name);
        let started = self.clock.now();
        let outcome = step.await;
        let duration = self.clock.elapsed_since(started);

        let (status, error, metrics) = match &outcome {
            Ok(metrics) => (StepStatus::Passed, None, metrics.clone()),
            Err(e) if e.is_timeout() => (StepStatus::TimedOut, Some(e.to_string()), None),
            Err(e) => (StepStatus::Failed, Some(e.to_string()), None),
        };
        log_info!(LABEL, "Step {}: {} in {:?}", name, status.label(), duration);

        self.results.record(StepResult {
            name: name.to_string(),
            status,
            duration,
            error,
            metrics,
        });
        outcome.map(|_| ())
    }

    fn write_report(&mut self) {
        let report = format!("{}\n", self.results);
        if let Err(e) = self
            .output
            .write_all(report.as_bytes())
            .and_then(|()| self.output.flush())
        {
            log_error!(LABEL, "Failed to write report: {}", e);
        }

        if let Some(path) = &self.config.report_json {
            let written = serde_json::to_string_pretty(&self.results)
                .map_err(|e| e.to_string())
                .and_then(|json| fs::write(path, json).map_err(|e| e.to_string()));
            match written {
                Ok(()) => log_info!(LABEL, "JSON report written to {}", path.display()),
                Err(e) => log_error!(LABEL, "Failed to write {}: {}", path.display(), e),
            }
        }
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }
}
