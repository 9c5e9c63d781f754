//! Shared polling and retry primitives.
//!
//! Every readiness wait in the installer goes through [`wait_until`], so the
//! timeout/interval policy lives in one place instead of being re-implemented
//! in each step.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Timeout and polling interval for a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Upper bound on the total time spent waiting.
    pub timeout: Duration,
    /// Delay between two checks.
    pub interval: Duration,
}

impl WaitPolicy {
    /// Create a policy with the given timeout and a 10 second interval.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: Duration::from_secs(10),
        }
    }

    /// Override the polling interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The check reported ready.
    Ready { attempts: u32, elapsed: Duration },
    /// The timeout elapsed before the check reported ready.
    TimedOut { attempts: u32, elapsed: Duration },
}

impl WaitOutcome {
    /// Whether the wait ended in the ready state.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Poll `check` until it returns `true` or the policy's timeout elapses.
///
/// Check errors count as "not ready yet": a readiness signal that cannot be
/// read is indistinguishable from one that is not ready. The check is always
/// evaluated at least once, even with a zero timeout. An attempt that is
/// still running when the timeout elapses is cancelled.
pub async fn wait_until<F, Fut>(policy: WaitPolicy, mut check: F) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let budget = policy.timeout.saturating_sub(start.elapsed());
        let result = match tokio::time::timeout(budget, check()).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "readiness check did not finish within {}s",
                policy.timeout.as_secs()
            )),
        };
        match result {
            Ok(true) => {
                return WaitOutcome::Ready {
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            Ok(false) => debug!(attempts, "Not ready yet"),
            Err(e) => debug!(attempts, error = %e, "Readiness check failed"),
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return WaitOutcome::TimedOut { attempts, elapsed };
        }

        let remaining = policy.timeout - elapsed;
        tokio::time::sleep(policy.interval.min(remaining)).await;
    }
}

/// Retry configuration for transient operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before the retry following `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Returns the last error once all attempts have failed.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if !self.should_retry(attempt) {
                        return Err(e.context(format!("{what} failed after {attempt} attempts")));
                    }
                    let delay = self.delay_for_attempt(attempt - 1);
                    debug!(
                        what,
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "Retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
