//! Resilience utilities: retry schedules and shutdown-aware backoff.
//!
//! Every background loop in the node (gossip outboxes, store CAS loops,
//! durable writes) retries transient failures with the same schedule type:
//!
//! - [`RetryConfig`]: exponential backoff with a per-attempt timeout
//! - [`sleep_or_shutdown`]: backoff pause that aborts when shutdown is signalled
//!
//! # Example
//!
//! ```rust
//! use gossip_replica::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::testing();
//! assert!(retry.delay_for_attempt(10) <= retry.max_delay);
//! assert!(retry.should_retry(1));
//! ```

use std::time::Duration;
use tokio::sync::watch;

/// Retry behaviour for a remote operation.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` to retry until acknowledged (gossip mode).
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    /// Retry until the peer acknowledges.
    ///
    /// A gossip worker owns the updates in its batch until a peer answers
    /// with an ack, so this schedule never gives up. The pause grows from a
    /// quarter of the RPC timeout up to `max_delay`.
    ///
    /// # Backoff Schedule (defaults: 200ms timeout, 1s cap)
    ///
    /// ```text
    /// Attempt  Timeout  Pause after failure
    /// -------  -------  -------------------
    /// 1        200ms    50ms
    /// 2        200ms    100ms
    /// 3        200ms    200ms
    /// 4        200ms    400ms
    /// 5        200ms    800ms
    /// 6+       200ms    1s
    /// ```
    pub fn gossip(rpc_timeout: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: rpc_timeout / 4,
            max_delay,
            backoff_factor: 2.0,
            attempt_timeout: rpc_timeout,
        }
    }

    /// Retry schedule for durable store calls.
    ///
    /// Store CAS loops retry until they succeed or shutdown begins; the
    /// store answers fast, so pauses stay short.
    pub fn store(timeout: Duration) -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            attempt_timeout: timeout,
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_millis(50),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Exponent saturates long before i32 overflow matters.
        let exponent = (attempt - 1).min(32) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns `false` when the caller should stop retrying.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => {
            // A dropped sender means the node is gone.
            changed.is_ok() && !*shutdown.borrow()
        }
    }
}
