use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::config::IronicConfig;
use crate::ironic::IronicError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &IronicConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            interval: Duration::from_millis(config.retry_interval_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Run `op`, retrying while it fails with an optimistic-lock conflict.
///
/// Any other error, or the last conflict once attempts are exhausted, is returned unchanged.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, IronicError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IronicError>>,
{
    let strategy = FixedInterval::new(policy.interval).take(policy.max_attempts.saturating_sub(1));

    RetryIf::spawn(strategy, op, |e: &IronicError| {
        if e.is_conflict() {
            tracing::debug!(error = %e, "Conflict from control plane, retrying");
            true
        } else {
            false
        }
    })
    .await
}
