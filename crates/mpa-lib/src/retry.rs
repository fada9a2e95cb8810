//! Retry utilities with exponential backoff and jitter.
//!
//! Every call to the control plane that may fail transiently (throttling,
//! 5xx, connection resets) goes through [`retry_with_backoff`]. Errors that
//! are not [`Error::is_retryable`] are returned on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use mpa_lib::retry::{retry_with_backoff, RetryConfig};
//!
//! let scale = retry_with_backoff(&RetryConfig::default(), "get_scale", || async {
//!     client.get_scale(&mapping, "default", "web").await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff settings for transient control-plane errors.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub steps: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub factor: f64,
    /// Jitter fraction applied around the delay (0.0 disables jitter)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            steps: 3,
            initial_delay: Duration::from_millis(100),
            factor: 3.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// A config that never retries
    pub fn none() -> Self {
        Self {
            steps: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `step` (zero based), without jitter
    pub fn delay_for(&self, step: u32) -> Duration {
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(step as i32);
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation, retrying transient failures with exponential
/// backoff.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut step = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if step >= config.steps {
                    debug!(
                        operation = %operation_name,
                        attempts = step + 1,
                        error = %e,
                        "Giving up after retries"
                    );
                    return Err(e);
                }

                let delay = jittered(config.delay_for(step), config.jitter);
                warn!(
                    operation = %operation_name,
                    attempt = step + 1,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                step += 1;
            }
        }
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`].
pub async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::timeout(format!(
            "{} did not finish within {:?}",
            what, deadline
        ))),
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..(1.0 + jitter));
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            steps: 3,
            initial_delay: Duration::from_millis(1),
            factor: 3.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_default_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(300));
        assert_eq!(config.delay_for(2), Duration::from_millis(900));
        assert_eq!(config.steps, 3);
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = retry_with_backoff(&fast(), "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_with_backoff(&fast(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(api_error(503, "ServiceUnavailable"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_after_steps() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_with_backoff(&fast(), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(api_error(429, "TooManyRequests"))
            }
        })
        .await;

        assert!(result.is_err());
        // first attempt plus three retries
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = retry_with_backoff(&fast(), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(api_error(404, "NotFound"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let result: Result<()> = with_deadline(Duration::from_millis(5), "tick", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
