//! Exponential-backoff retry for provider calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently to retry a failing operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 act as 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Preset for LLM provider calls: delays of 1s, 2s, 4s... capped at 10s.
    pub fn provider_call(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(2.0)
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO).with_max_delay(Duration::ZERO)
    }

    /// Delay before attempt `attempt` (0-indexed). The first attempt never waits.
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let millis =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::provider_call(3)
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the policy runs out of attempts. Returns the last error.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            debug!(
                "{}: waiting {:?} before attempt {}/{}",
                operation_name,
                delay,
                attempt + 1,
                attempts
            );
            sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{}: succeeded on attempt {}/{}", operation_name, attempt + 1, attempts);
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                debug!("{}: not retryable, giving up: {}", operation_name, e);
                return Err(e);
            }
            Err(e) => {
                let remaining = attempts - attempt - 1;
                if remaining == 0 {
                    warn!("{}: all {} attempts failed. Last error: {}", operation_name, attempts, e);
                    return Err(e);
                }
                warn!(
                    "{}: attempt {}/{} failed ({}), {} retries remaining",
                    operation_name,
                    attempt + 1,
                    attempts,
                    e,
                    remaining
                );
                attempt += 1;
            }
        }
    }
}
