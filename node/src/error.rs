use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineError;

/// Everything that can go wrong while supervising a test run.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("{component}: initialization failed: {reason}")]
    Initialization { component: String, reason: String },

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("{component}: verification failed: {reason}")]
    Verification { component: String, reason: String },

    #[error("{actor}: timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        actor: String,
        timeout: Duration,
    },

    #[error("{actor}: {operation} failed: {source}")]
    Operation {
        operation: String,
        actor: String,
        #[source]
        source: EngineError,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{component}: shutdown failed: {reason}")]
    Shutdown { component: String, reason: String },

    #[error("phase '{phase}' failed: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: Box<HarnessError>,
    },

    #[error("overall deadline exceeded before phase '{phase}'")]
    DeadlineExceeded { phase: &'static str },

    #[error("cleanup failed: {}", join_errors(.0))]
    Cleanup(Vec<HarnessError>),
}

fn join_errors(errors: &[HarnessError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HarnessError {
    pub(crate) fn operation(actor: &str, operation: &str, source: EngineError) -> Self {
        HarnessError::Operation {
            operation: operation.to_string(),
            actor: actor.to_string(),
            source,
        }
    }

    pub(crate) fn timeout(actor: &str, operation: impl Into<String>, timeout: Duration) -> Self {
        HarnessError::Timeout {
            operation: operation.into(),
            actor: actor.to_string(),
            timeout,
        }
    }

    /// True if the failure was caused by a bounded wait or the overall
    /// deadline running out, looking through phase and retry wrappers.
    pub fn is_timeout(&self) -> bool {
        match self {
            HarnessError::Timeout { .. } | HarnessError::DeadlineExceeded { .. } => true,
            HarnessError::Phase { source, .. } | HarnessError::RetryExhausted { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }

    /// The phase a failure is attributed to, if any.
    pub fn phase(&self) -> Option<&'static str> {
        match self {
            HarnessError::Phase { phase, .. } | HarnessError::DeadlineExceeded { phase } => {
                Some(*phase)
            }
            _ => None,
        }
    }
}
