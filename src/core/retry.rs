// src/core/retry.rs

//! A single jittered, capped exponential backoff policy shared by the
//! aggregate store's CAS-conflict retry (`core::store`) and the
//! instantiation pipeline's external-call retry (`core::pipeline`), mirroring
//! `spineldb`'s reconnect/backoff helpers used across its replication and
//! cluster-gossip retry loops.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self { max_attempts, base, cap }
    }

    /// CAS-conflict retries on the in-memory aggregate store: a handful of
    /// short attempts is enough since contention there is measured in
    /// microseconds, not network round-trips.
    pub fn for_aggregate_store() -> Self {
        Self::new(8, Duration::from_millis(2), Duration::from_millis(50))
    }

    /// External-call retries in the instantiation pipeline (spec §4.8):
    /// cloud API calls and lab host calls that can take seconds to fail.
    pub fn for_external_call() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(10))
    }

    /// Full jitter backoff (`rand(0, min(cap, base * 2^attempt))`), the same
    /// shape `spineldb` uses for its replica reconnect loop.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let bound = exp.min(self.cap);
        let millis = bound.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(0..=millis);
        Duration::from_millis(jittered)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping a jittered backoff
/// between attempts. `is_retryable` decides whether a given error should be
/// retried at all (e.g. `OrchestratorError::is_transient`); the first
/// non-retryable error, or the last attempt's error, is returned as-is.
pub async fn retry_async<T, E, F, Fut>(
    policy: RetryPolicy,
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt + 1 >= policy.max_attempts || !is_retryable(&e) {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}
