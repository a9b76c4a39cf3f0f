//! Declarative retry policies.

use crate::error::ErrorKind;
use std::collections::BTreeSet;
use std::time::Duration;

/// Which failures are retried, how many times, and how long to wait.
///
/// Policies are immutable once built. The backoff is quadratic in the
/// attempt number: the wait before retry `n` (1-based) is
/// `n² × backoff_multiplier` seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_multiplier: u32,
    retryable: BTreeSet<ErrorKind>,
}

impl RetryPolicy {
    /// Starts building a policy from the defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Creates a policy that never retries.
    ///
    /// Used for foreground sends where the caller is waiting on the result.
    pub fn no_retry() -> Self {
        Self::builder().with_max_retries(0).build()
    }

    /// Maximum number of retries after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff multiplier in seconds.
    pub fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    /// Failure classes this policy retries.
    pub fn retryable_kinds(&self) -> impl Iterator<Item = ErrorKind> + '_ {
        self.retryable.iter().copied()
    }

    /// Returns true if a failure of `kind` after `attempts_done` retries
    /// should be retried.
    pub fn should_retry(&self, kind: ErrorKind, attempts_done: u32) -> bool {
        self.retryable.contains(&kind) && attempts_done < self.max_retries
    }

    /// Delay before the retry numbered `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt);
        Duration::from_secs(
            attempt
                .saturating_mul(attempt)
                .saturating_mul(u64::from(self.backoff_multiplier)),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    backoff_multiplier: u32,
    retryable: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_multiplier: 0,
            retryable: BTreeSet::from([ErrorKind::TransientBackend]),
        }
    }
}

impl RetryPolicyBuilder {
    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff multiplier in seconds.
    pub fn with_backoff_multiplier(mut self, multiplier: u32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Replaces the set of retryable failure classes.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Builds the policy.
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_multiplier: self.backoff_multiplier,
            retryable: self.retryable,
        }
    }
}
