use std::future::Future;
use std::time::Duration;

use crate::error::HarnessError;
use crate::timing::TimeProvider;

/// How often and how patiently a flaky operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations, including the first.
    pub attempts: u32,
    /// Sleep before the second attempt; doubled after each retry.
    pub backoff: Duration,
    /// Upper bound on a single sleep. `None` leaves doubling uncapped.
    pub max_backoff: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts,
            backoff,
            max_backoff: None,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        match self.max_backoff {
            Some(cap) => doubled.min(cap),
            None => doubled,
        }
    }

    fn first_backoff(&self) -> Duration {
        match self.max_backoff {
            Some(cap) => self.backoff.min(cap),
            None => self.backoff,
        }
    }
}

/// Runs `f` until it succeeds or the policy's attempts are used up.
///
/// Sleeps happen only between attempts, through `clock`. On exhaustion the
/// last failure is returned wrapped in [`HarnessError::RetryExhausted`].
pub async fn retry_operation<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn TimeProvider,
    operation: &str,
    mut f: F,
) -> Result<T, HarnessError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HarnessError>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.first_backoff();
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            log_debug!(
                "retry",
                "Retrying {} (attempt {}/{}) after {:?}",
                operation,
                attempt + 1,
                attempts,
                delay
            );
            clock.sleep(delay).await;
            delay = policy.next_backoff(delay);
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                log_warn!("retry", "{} attempt {} failed: {}", operation, attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    // attempts >= 1, so at least one error was recorded
    let source = last_error.unwrap_or_else(|| HarnessError::Validation(format!(
        "{operation} was never attempted"
    )));
    Err(HarnessError::RetryExhausted {
        operation: operation.to_string(),
        attempts,
        source: Box::new(source),
    })
}
