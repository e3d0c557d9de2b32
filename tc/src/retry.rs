//! Exponential backoff for transient store failures

use std::future::Future;
use std::time::Duration;

use kvstore::StoreResult;
use rand::Rng;
use tracing::{error, warn};

use crate::coordinator::RetryConfig;

/// Capped exponential backoff with jitter and an attempt ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait, or None once exhausted
    ///
    /// The delay is drawn from the upper half of the current exponential step
    /// so that nodes failing together spread out their retries.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << (self.attempts - 1).min(16);
        let step = self.initial.saturating_mul(factor).min(self.max);
        let half = step / 2;
        let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        Some(half + Duration::from_millis(jitter_ms))
    }

    /// Failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Start over after a success
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Run a store operation, retrying transient failures per the policy
///
/// Non-transient results (success or definitive errors such as `NotFound`)
/// are returned as soon as they happen. When the policy is exhausted the last
/// transient error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(%what, attempt = backoff.attempts(), ?delay, error = %e, "Transient store error, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(%what, attempts = backoff.attempts(), error = %e, "Retries exhausted");
                    return Err(e);
                }
            },
            other => return other,
        }
    }
}
