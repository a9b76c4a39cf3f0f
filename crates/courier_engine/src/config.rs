//! Configuration for the sync engine.

use crate::policy::RetryPolicy;
use std::time::Duration;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum time between two background syncs of the same kind.
    pub throttle_window: Duration,
    /// Maximum age of a queued work item, measured from its creation.
    pub outbox_lifetime: Duration,
    /// Coalescing delay for user data reports.
    pub batch_delay: Duration,
    /// Maximum number of remote calls running at once.
    pub worker_threads: usize,
    /// Policy for background syncs.
    pub background_policy: RetryPolicy,
    /// Policy for foreground calls the user is waiting on.
    pub foreground_policy: RetryPolicy,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            throttle_window: Duration::from_secs(1),
            outbox_lifetime: Duration::from_secs(48 * 60 * 60),
            batch_delay: Duration::from_secs(1),
            worker_threads: 2,
            background_policy: RetryPolicy::builder()
                .with_max_retries(3)
                .with_backoff_multiplier(2)
                .build(),
            foreground_policy: RetryPolicy::no_retry(),
        }
    }

    /// Sets the throttle window.
    pub fn with_throttle_window(mut self, window: Duration) -> Self {
        self.throttle_window = window;
        self
    }

    /// Sets the outbox lifetime.
    pub fn with_outbox_lifetime(mut self, lifetime: Duration) -> Self {
        self.outbox_lifetime = lifetime;
        self
    }

    /// Sets the batch delay.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Sets the number of concurrent remote calls.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets the background retry policy.
    pub fn with_background_policy(mut self, policy: RetryPolicy) -> Self {
        self.background_policy = policy;
        self
    }

    /// Sets the foreground retry policy.
    pub fn with_foreground_policy(mut self, policy: RetryPolicy) -> Self {
        self.foreground_policy = policy;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
