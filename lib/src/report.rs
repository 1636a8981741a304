use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const BANNER_WIDTH: usize = 60;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    TimedOut,
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Passed => "PASSED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::TimedOut => "TIMED OUT",
        }
    }
}

/// Outcome of one tracked unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub error: Option<String>,
    /// Structured metrics captured by the step, if any.
    pub metrics: Option<serde_json::Value>,
}

/// Aggregate outcome of one orchestrator run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Results {
    pub total_steps: usize,
    pub passed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    pub steps: Vec<StepResult>,
    pub final_status: StepStatus,
    pub error_details: Option<String>,
    /// Secondary problems that did not decide the outcome, e.g. teardown failures.
    pub warnings: Vec<String>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finished step and updates the counters.
    pub fn record(&mut self, step: StepResult) {
        self.total_steps += 1;
        match step.status {
            StepStatus::Passed => self.passed_steps += 1,
            StepStatus::Skipped => self.skipped_steps += 1,
            StepStatus::Failed | StepStatus::TimedOut => self.failed_steps += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }
        self.steps.push(step);
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Sets the final status. A run passes only if it recorded at least one
    /// step, no step failed, and no error was reported.
    pub fn finalize(&mut self, total_duration: Duration, error: Option<String>) {
        self.total_duration = total_duration;
        let clean = error.is_none() && self.failed_steps == 0 && self.total_steps > 0;
        self.final_status = if clean {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        self.error_details = error;
    }

    pub fn passed(&self) -> bool {
        self.final_status == StepStatus::Passed
    }
}

fn rounded(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let banner = "=".repeat(BANNER_WIDTH);
        writeln!(f, "{}", banner)?;
        writeln!(f, "PROTOCOL TEST REPORT")?;
        writeln!(f, "{}", banner)?;
        writeln!(
            f,
            "Summary: {} total, {} passed, {} failed, {} skipped in {:?}",
            self.total_steps,
            self.passed_steps,
            self.failed_steps,
            self.skipped_steps,
            rounded(self.total_duration)
        )?;

        writeln!(f, "Steps:")?;
        for step in &self.steps {
            writeln!(
                f,
                "  [{}] {} ({:?})",
                step.status.label(),
                step.name,
                rounded(step.duration)
            )?;
            if let Some(error) = &step.error {
                writeln!(f, "      error: {}", error)?;
            }
        }

        if let Some(error) = &self.error_details {
            writeln!(f, "Error details:")?;
            writeln!(f, "  {}", error)?;
        }

        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  {}", warning)?;
            }
        }

        writeln!(f, "Final status: {}", self.final_status.label())?;
        write!(f, "{}", banner)
    }
}
