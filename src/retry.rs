//! Exponential backoff with optional jitter and capped attempts.
//!
//! The helper never decides what is retryable on its own: [`with_retry`]
//! retries every failure, [`with_retry_if`] defers to a caller predicate.
//! Once attempts are exhausted the last error is returned unchanged.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay applied as symmetric jitter. `0`
    /// disables jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn no_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

/// Delay before the attempt following `attempt` (1-based).
///
/// `min(max_delay, base_delay * 2^(attempt-1))`, then shifted by
/// `(random * 2 - 1) * delay * jitter_ratio` and rounded to whole
/// milliseconds. `random` must be in `[0, 1)`.
pub fn compute_backoff_delay(attempt: u32, policy: &RetryPolicy, random: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(62) as i32;
    let exp_ms = (policy.base_delay.as_secs_f64() * 1000.0 * 2f64.powi(exponent))
        .min(policy.max_delay.as_secs_f64() * 1000.0);

    if policy.jitter_ratio <= 0.0 {
        return Duration::from_secs_f64(exp_ms / 1000.0);
    }

    let jitter = (random * 2.0 - 1.0) * exp_ms * policy.jitter_ratio;
    let ms = (exp_ms + jitter).round().max(0.0);
    Duration::from_millis(ms as u64)
}

/// Runs `op` until it succeeds or `policy.max_attempts` is reached.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    with_retry_if(policy, op, |_| true).await
}

/// Like [`with_retry`], but stops at the first error `should_retry`
/// rejects.
pub async fn with_retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut op: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(error = %err, attempt, max_attempts, "retry attempts exhausted");
                    return Err(err);
                }

                let delay = compute_backoff_delay(attempt, policy, rand::random::<f64>());
                warn!(
                    error = %err,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10);
        let delays: Vec<u128> = (1..=6)
            .map(|attempt| compute_backoff_delay(attempt, &p, 0.5).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let p = RetryPolicy {
            jitter_ratio: 0.5,
            ..policy(3)
        };
        assert_eq!(compute_backoff_delay(2, &p, 0.0).as_millis(), 100);
        assert_eq!(compute_backoff_delay(2, &p, 0.5).as_millis(), 200);
        assert_eq!(compute_backoff_delay(2, &p, 0.999_999).as_millis(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<&str, String> = with_retry(&policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), String> = with_retry(&policy(3), || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {}", n + 1))
            }
        })
        .await;
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_stops_on_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), String> = with_retry_if(
            &policy(5),
            || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("not found".to_string())
                }
            },
            |err| err != "not found",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts() {
        let start = tokio::time::Instant::now();
        let _: Result<(), String> = with_retry(&policy(3), || async { Err("down".to_string()) }).await;
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
