//! Bounded retry of a single operation
//!
//! Unlike a waiter, which polls a state, these helpers re-run an operation
//! while its *error* says "try again": a mutation rejected because a
//! dependency has not propagated yet, a read racing a fresh create, or a
//! delete waiting for the resource to disappear.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts; 0 means bounded only by the timeout
    pub max_attempts: u32,

    /// Initial delay between retries
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Delay after the given (0-indexed) failed attempt, before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }

    fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Re-run `op` while `should_retry` holds for its error.
///
/// Gives up with [`Error::TimedOut`] (carrying the last error) once `timeout`
/// has elapsed or the attempt budget is spent. A single attempt is cut off at
/// the deadline as well.
pub async fn retry_when<T, F, Fut, P>(
    config: &RetryConfig,
    timeout: Duration,
    mut op: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    let mut last_error: Option<Error> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let err = match tokio::time::timeout(remaining, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => {
                tracing::warn!("operation still running at the {:?} deadline", timeout);
                return Err(Error::TimedOut {
                    timeout,
                    last_state: None,
                    expected: Vec::new(),
                    last_error: last_error.map(Box::new),
                });
            }
        };
        attempts += 1;

        if !should_retry(&err) {
            return Err(err);
        }

        let now = Instant::now();
        if now >= deadline || config.attempts_exhausted(attempts) {
            tracing::warn!("giving up after {} attempt(s): {}", attempts, err);
            return Err(Error::TimedOut {
                timeout,
                last_state: None,
                expected: Vec::new(),
                last_error: Some(Box::new(err)),
            });
        }

        let delay = config.sleep_for(attempts - 1);
        tracing::debug!("retrying in {:?} after: {}", delay, err);
        last_error = Some(err);
        tokio::time::sleep_until((now + delay).min(deadline)).await;
    }
}

/// Retry while the operation reports not-found
pub async fn retry_when_not_found<T, F, Fut>(
    config: &RetryConfig,
    timeout: Duration,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(config, timeout, op, Error::is_not_found).await
}

/// Retry not-found only for a resource created moments ago; an existing
/// resource gets a single attempt
pub async fn retry_when_new_resource_not_found<T, F, Fut>(
    config: &RetryConfig,
    timeout: Duration,
    mut op: F,
    is_new_resource: bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if !is_new_resource {
        return op().await;
    }
    retry_when_not_found(config, timeout, op).await
}

/// Retry while the operation fails with one of the given API error codes
pub async fn retry_when_api_code<T, F, Fut, S>(
    config: &RetryConfig,
    timeout: Duration,
    op: F,
    codes: &[S],
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    S: AsRef<str>,
{
    retry_when(config, timeout, op, |err| {
        err.api_code()
            .is_some_and(|code| codes.iter().any(|c| c.as_ref() == code))
    })
    .await
}

/// Re-run `op` until it reports not-found.
///
/// Fails with [`Error::StillExists`] when the resource is still there at the
/// deadline; any other error is returned immediately.
pub async fn retry_until_not_found<T, F, Fut>(
    config: &RetryConfig,
    timeout: Duration,
    what: &str,
    mut op: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, op()).await {
            Ok(Err(err)) if err.is_not_found() => return Ok(()),
            Ok(Err(err)) => return Err(err),
            Ok(Ok(_)) => {}
            Err(_) => return Err(Error::StillExists(what.to_string())),
        }
        attempts += 1;

        let now = Instant::now();
        if now >= deadline || config.attempts_exhausted(attempts) {
            return Err(Error::StillExists(what.to_string()));
        }
        tokio::time::sleep_until((now + config.sleep_for(attempts - 1)).min(deadline)).await;
    }
}
