//! Bounded exponential backoff for transient stage failures.

use crate::config::RetryConfig;
use crate::error::DubError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Extra factor applied after quota errors.
    pub quota_multiplier: f64,
    pub use_jitter: bool,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            quota_multiplier: config.quota_multiplier,
            use_jitter: config.jitter,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            quota_multiplier: 1.0,
            use_jitter: false,
            jitter_factor: 0.0,
        }
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Delay before retry number `attempt + 1`.
    pub fn calculate_delay(&self, attempt: u32, error: &DubError) -> Duration {
        let mut millis =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        if error.is_quota() {
            millis *= self.quota_multiplier;
        }
        let delay = Duration::from_millis(millis.max(0.0) as u64).min(self.max_delay);

        if self.use_jitter && self.jitter_factor > 0.0 {
            let range = delay.as_millis() as f64 * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-range..=range);
            Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
        } else {
            delay
        }
    }
}

/// A value together with the number of retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Debug)]
pub struct RetryFailure {
    pub error: DubError,
    pub retries: u32,
}

/// Runs an operation under a [`RetryPolicy`], stopping early on
/// non-retryable errors and on cancellation.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `operation` receives the zero-based attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> std::result::Result<Retried<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    error: DubError::cancelled("cancelled"),
                    retries: attempt,
                });
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    return Ok(Retried {
                        value,
                        retries: attempt,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() || attempt + 1 >= max_attempts {
                return Err(RetryFailure {
                    error,
                    retries: attempt,
                });
            }

            let delay = self.policy.calculate_delay(attempt, &error);
            tracing::warn!(
                operation = operation_name,
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error: DubError::cancelled("cancelled"),
                        retries: attempt,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
