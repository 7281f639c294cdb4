//! Bounded retry with a fixed inter-attempt delay

use std::future::Future;
use std::time::Duration;

use crate::bluetooth::{BackendError, PairingGuard};
use crate::config::PolicyConfig;

/// Result of running an action under the policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// How many times the action ran
    pub attempts: u32,
    pub result: Result<T, BackendError>,
}

/// Re-issues an action only for timeouts and transient errors.
/// Pairing requests, missing environment and cancellation stop it at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(policy.retry_count, policy.retry_delay)
    }

    /// Upper bound on attempts: retries + 1
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `action` until it succeeds, fails terminally or the attempt
    /// budget is spent. The action receives the 1-based attempt number.
    /// The delay between attempts is cut short if the guard fires.
    pub async fn run<T, F, Fut>(&self, guard: &PairingGuard, mut action: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            let error = match action(attempt).await {
                Ok(value) => {
                    return Attempted {
                        attempts: attempt,
                        result: Ok(value),
                    }
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Attempted {
                    attempts: attempt,
                    result: Err(error),
                };
            }

            log::warn!(
                "Attempt {}/{} failed ({}), retrying in {:.1}s",
                attempt,
                max_attempts,
                error,
                self.delay.as_secs_f64()
            );

            tokio::select! {
                biased;
                () = guard.cancelled() => {
                    return Attempted {
                        attempts: attempt,
                        result: Err(guard.interruption()),
                    };
                }
                () = tokio::time::sleep(self.delay) => {}
            }
            attempt += 1;
        }
    }
}
