//! Bounded retries for writes which may lose an optimistic concurrency race.
use models::node::ClusterClientError;

use std::future::Future;
use std::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{event, Level};

/// Backoff policy for conflicting writes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry. Each later retry doubles it.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // Powers of two, scaled so that the first delay is `base_delay`.
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Runs `action` until it succeeds, fails with something other than a conflict, or runs out of
/// attempts.
///
/// `action` is called afresh for every attempt, so it should re-read whatever it needs (such as
/// the object's current `resourceVersion`) when it is retried.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    action: F,
) -> Result<T, ClusterClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClusterClientError>>,
{
    RetryIf::spawn(config.strategy(), action, |err: &ClusterClientError| {
        let conflict = err.is_conflict();
        if conflict {
            event!(Level::WARN, "Conflict during {}, retrying: '{}'", operation, err);
        }
        conflict
    })
    .await
}
