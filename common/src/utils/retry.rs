use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::telemetry::TelemetrySink;
use crate::utils::config::AppConfig;

/// Exponential-backoff settings for one retriable operation.
///
/// Attempt `n` (1-indexed) that fails and is retriable sleeps
/// `min(base_delay * multiplier^(n-1), max_delay)` before attempt `n+1`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay: Duration::from_secs_f64(config.retry_delay),
            multiplier: config.retry_backoff,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.powi(exponent.min(i32::MAX as u32) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Identifies the operation being retried in telemetry and logs.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub job_id: String,
    pub stage: String,
    pub correlation_id: String,
    pub tenant_id: Option<String>,
}

impl RetryContext {
    pub fn new(job_id: &str, stage: &str, correlation_id: &str, tenant_id: Option<&str>) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage: stage.to_string(),
            correlation_id: correlation_id.to_string(),
            tenant_id: tenant_id.map(ToString::to_string),
        }
    }
}

/// Run `op` under `policy`, retrying failures matching `retry_on`.
///
/// A `retry_attempt` event is emitted before each backoff sleep. The last
/// error is returned once attempts are exhausted or the error is not
/// retriable.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: RetryPolicy,
    ctx: &RetryContext,
    telemetry: &TelemetrySink,
    retry_on: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        job_id = %ctx.job_id,
                        stage = %ctx.stage,
                        correlation_id = %ctx.correlation_id,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < max_attempts && retry_on(&err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    job_id = %ctx.job_id,
                    stage = %ctx.stage,
                    correlation_id = %ctx.correlation_id,
                    attempt,
                    max_attempts,
                    backoff_secs = delay.as_secs_f64(),
                    error = %err,
                    "retriable failure, backing off"
                );

                telemetry
                    .emit_retry_attempt(
                        &ctx.job_id,
                        &ctx.stage,
                        &ctx.correlation_id,
                        attempt,
                        max_attempts,
                        &err.to_string(),
                        delay.as_secs_f64(),
                        ctx.tenant_id.as_deref(),
                    )
                    .await;

                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(10),
        }
    }

    fn ctx() -> RetryContext {
        RetryContext::new("job-1", "fetch", "trace-1", None)
    }

    #[test]
    fn delay_follows_exponential_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(policy.delay_after(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn succeeds_first_try_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u32, String> = retry_with_backoff(
            fast_policy(),
            &ctx(),
            &TelemetrySink::disabled(),
            |_| true,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<&str, String> = retry_with_backoff(
            fast_policy(),
            &ctx(),
            &TelemetrySink::disabled(),
            |_| true,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("rate limited".to_string())
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), String> = retry_with_backoff(
            fast_policy(),
            &ctx(),
            &TelemetrySink::disabled(),
            |_| true,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("still broken".to_string())
                }
            },
        )
        .await;

        assert_eq!(result, Err("still broken".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retriable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), String> = retry_with_backoff(
            fast_policy(),
            &ctx(),
            &TelemetrySink::disabled(),
            |err: &String| err.contains("transient"),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("validation failed".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
