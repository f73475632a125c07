//! Retry with exponential backoff and jitter
//!
//! A [`RetryStrategy`] runs one asynchronous operation up to `max_attempts`
//! times. Between attempts it sleeps for
//! `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`, perturbed
//! uniformly by up to `jitter_factor` in either direction so that callers that
//! failed together do not retry together.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Decides whether a failure may be retried
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Called with `(attempt, error, delay)` before each backoff sleep
pub type RetryHook = Arc<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Cap on the un-jittered delay
    pub max_delay: Duration,

    pub backoff_multiplier: f64,

    /// Fraction (0.0 - 1.0) of the delay added or removed at random
    pub jitter_factor: f64,

    /// Deadline for the whole sequence, sleeps included
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            timeout: None,
        }
    }
}

/// Final value or last error, with the number of attempts made
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
    is_retryable: RetryPredicate,
    on_retry: Option<RetryHook>,
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStrategy")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryStrategy {
    /// Strategy that retries whatever [`Error::is_retryable`] accepts
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            is_retryable: Arc::new(Error::is_retryable),
            on_retry: None,
        }
    }

    pub fn with_retry_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    pub fn with_on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(u32, &Error, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the attempt that follows failed attempt `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let jitter = self.config.jitter_factor;
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };

        Duration::try_from_secs_f64((capped * factor).max(0.0)).unwrap_or(self.config.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts, or runs past the configured deadline
    pub async fn execute<T, F, Fut>(&self, name: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, operation()).await {
                    Ok(result) => result,
                    Err(_) => {
                        return RetryOutcome {
                            result: Err(self.deadline_exceeded(name, attempt)),
                            attempts: attempt,
                        }
                    }
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %name, attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if attempt >= self.config.max_attempts {
                debug!(operation = %name, attempts = attempt, error = %error, "Retry budget exhausted");
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            if !(self.is_retryable)(&error) {
                debug!(operation = %name, attempt, error = %error, "Error is not retryable");
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.calculate_delay(attempt);

            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    debug!(operation = %name, attempt, "Next backoff would pass the deadline");
                    return RetryOutcome {
                        result: Err(self.deadline_exceeded(name, attempt)),
                        attempts: attempt,
                    };
                }
            }

            if let Some(hook) = &self.on_retry {
                hook(attempt, &error, delay);
            }
            debug!(
                operation = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );

            tokio::time::sleep(delay).await;
        }
    }

    fn deadline_exceeded(&self, name: &str, attempts: u32) -> Error {
        Error::DeadlineExceeded {
            operation: name.to_string(),
            timeout: self.config.timeout.unwrap_or_default(),
            attempts,
        }
    }
}
