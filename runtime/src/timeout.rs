//! Backoff of flow timeouts.

use crate::config::FlowTimeoutConfig;
use std::time::Duration;

/// Delay before the next timeout of a flow that has already timed out
/// `retry_count` times.
///
/// The nominal delay `timeout × backoff_base^min(retry_count, max_restart_count)`
/// is scaled by `(1 + jitter) / 2`, so a `jitter` drawn uniformly from `[0, 1)`
/// gives a delay uniformly in `[delay / 2, delay)`. The result is never below
/// one second, and saturates at [`Duration::MAX`] when the nominal delay is
/// infinite or too large to represent.
#[must_use]
pub fn timeout_delay(config: &FlowTimeoutConfig, retry_count: u32, jitter: f64) -> Duration {
    let exponent = i32::try_from(retry_count.min(config.max_restart_count)).unwrap_or(i32::MAX);
    let nominal = config.timeout.as_secs_f64() * config.backoff_base.powi(exponent);
    let randomized = (1.0 + jitter.clamp(0.0, 1.0)) * nominal / 2.0;
    Duration::try_from_secs_f64(randomized.max(1.0)).unwrap_or(Duration::MAX)
}

/// Jitter for [`timeout_delay`], uniform in `[0, 1)`.
#[must_use]
pub fn random_jitter() -> f64 {
    rand::random::<f64>()
}
