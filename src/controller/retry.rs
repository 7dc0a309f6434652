//! Bounded retries with backoff and jitter for Kubernetes writes

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::error::Error;

#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total attempts, including the first
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
    /// Each delay is stretched by a random fraction in `[0, jitter)`
    pub jitter: f64,
    pub cap: Duration,
}

impl Backoff {
    /// Backoff used for optimistic-concurrency conflicts: 5 steps, 100ms, jitter 1.0
    pub fn conflict() -> Self {
        Self {
            steps: 5,
            base: Duration::from_millis(100),
            factor: 1.0,
            jitter: 1.0,
            cap: Duration::from_secs(1),
        }
    }

    pub fn exponential(steps: u32, base: Duration, cap: Duration) -> Self {
        Self {
            steps,
            base,
            factor: 2.0,
            jitter: 0.1,
            cap,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = scaled.min(self.cap.as_millis() as f64);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).round() as u64)
    }
}

/// Run `operation` until it succeeds, `retryable` rejects the error, or the steps run out
pub async fn retry_if<F, Fut, T>(
    backoff: &Backoff,
    operation_name: &str,
    retryable: impl Fn(&Error) -> bool,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= backoff.steps.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
                let delay = backoff.delay(attempt - 1);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub fn is_conflict(err: &Error) -> bool {
    matches!(err, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
}

/// Retry a Kubernetes write while it fails with 409 Conflict
pub async fn retry_on_conflict<F, Fut, T>(operation_name: &str, operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_if(&Backoff::conflict(), operation_name, is_conflict, operation).await
}
