//! Retry backoff
//!
//! `delay = base * 2^min(retries, cap) * (0.5 + 0.5 * jitter)`, jitter in [0, 1).

use rand::Rng;
use std::time::Duration;

/// Backoff delay for a given retry count and jitter
pub fn backoff(base: Duration, retries: u32, cap: u32, jitter: f64) -> Duration {
    let exp = retries.min(cap).min(31);
    let max = base.saturating_mul(1u32 << exp);
    max.mul_f64(0.5 + 0.5 * jitter.clamp(0.0, 1.0))
}

/// Backoff delay with a random jitter
pub fn random_backoff(base: Duration, retries: u32, cap: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().r#gen();
    backoff(base, retries, cap, jitter)
}
