use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

/// Bounded-concurrency gate shared by all three provider clients, plus
/// reactive backoff on 429/502/503/504. No preemptive throttling: callers
/// only slow down after a provider actually signals it is overloaded.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl RateLimiter {
    pub fn new(max_concurrent: u32, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1) as usize)),
            max_retries,
            base_backoff_ms,
        }
    }

    /// Runs `f` under the concurrency gate, retrying with exponential backoff
    /// plus jitter whenever `is_retryable_status` reports the attempt should
    /// be retried, *and* whenever `f` itself returns `Err` (network errors,
    /// timeouts, connection resets) per spec.md §4.8. `f` is handed the
    /// attempt number (starting at 0).
    pub async fn run<F, Fut, T>(&self, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<RetryOutcome<T>>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut attempt = 0u32;
        loop {
            let reason = match f(attempt).await {
                Ok(RetryOutcome::Done(value)) => return Ok(value),
                Ok(RetryOutcome::Retry(reason)) => reason,
                Err(e) => e.to_string(),
            };

            if attempt >= self.max_retries {
                return Err(anyhow::anyhow!(
                    "exhausted {} retries: {reason}",
                    self.max_retries
                ));
            }
            let delay = self.backoff(attempt);
            warn!(attempt, ?delay, %reason, "retrying after provider backoff signal");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let millis = self.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.2);
        Duration::from_millis((millis as f64 * (1.0 + jitter)) as u64)
    }
}

pub enum RetryOutcome<T> {
    Done(T),
    Retry(String),
}

/// Status codes worth retrying through the limiter: rate-limited or the
/// server signalling transient overload.
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status.as_u16(),
        429 | 502 | 503 | 504
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_done() {
        let limiter = RateLimiter::new(4, 3, 1);
        let calls = AtomicU32::new(0);

        let result = limiter
            .run(|attempt| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Ok(RetryOutcome::Retry("simulated 503".to_string()))
                    } else {
                        Ok(RetryOutcome::Done(42))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let limiter = RateLimiter::new(4, 2, 1);
        let result = limiter
            .run(|_attempt| async { Ok(RetryOutcome::<()>::Retry("always busy".to_string())) })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn retryable_status_codes() {
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(reqwest::StatusCode::OK));
    }
}
