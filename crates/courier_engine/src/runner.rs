//! Retry loop around [`TaskExecutor`].
//!
//! A top-level [`RetryableTaskRunner::execute`] call creates an
//! [`ExecutionContext`] that travels with the work through every attempt:
//!
//! ```text
//! attempt ──▶ should_cancel? ──yes──▶ cancelled(items)
//!    │no
//!    ▼
//! before()  (first attempt only)
//!    ▼
//! executor.run ──ok──▶ after(items, output)
//!    │err
//!    ▼
//! policy.should_retry? ──no──▶ error(items, err)
//!    │yes
//!    ▼
//! timer(attempts² × multiplier s) ──▶ attempt
//! ```

use crate::error::{SyncError, SyncResult};
use crate::executor::TaskExecutor;
use crate::policy::RetryPolicy;
use crate::scheduler::Scheduler;
use std::sync::Arc;

/// Lifecycle hooks for one kind of retryable work.
///
/// Exactly one of [`after`](Self::after), [`error`](Self::error) or
/// [`cancelled`](Self::cancelled) is called per top-level execution.
pub trait RetryableTask: Send + Sync + 'static {
    /// Work item type.
    type Item: Clone + Send + Sync + 'static;
    /// Result of a successful run.
    type Output: Send + 'static;

    /// Called once before the first attempt. Never called on a retry.
    fn before(&self, _items: &[Self::Item]) {}

    /// Performs the remote call. Runs on the background pool.
    fn run(&self, items: &[Self::Item]) -> SyncResult<Self::Output>;

    /// Called once after a successful attempt.
    fn after(&self, items: Vec<Self::Item>, output: Self::Output);

    /// Called once on a terminal failure.
    fn error(&self, items: Vec<Self::Item>, error: SyncError);

    /// Checked before every attempt.
    fn should_cancel(&self) -> bool {
        false
    }

    /// Called instead of an attempt when [`should_cancel`](Self::should_cancel)
    /// returns true, or when the scheduler has shut down.
    fn cancelled(&self, _items: Vec<Self::Item>) {}
}

/// Per-execution state. Owned by exactly one retry chain.
pub struct ExecutionContext<T: RetryableTask> {
    attempts_done: u32,
    items: Arc<Vec<T::Item>>,
    policy: RetryPolicy,
    task: Arc<T>,
}

impl<T: RetryableTask> ExecutionContext<T> {
    /// Retries performed so far.
    pub fn attempts_done(&self) -> u32 {
        self.attempts_done
    }

    fn into_items(self) -> Vec<T::Item> {
        Arc::try_unwrap(self.items).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}

/// Runs [`RetryableTask`]s under a [`RetryPolicy`].
///
/// The runner holds no per-execution state; concurrent `execute` calls each
/// own an independent [`ExecutionContext`].
#[derive(Debug, Clone)]
pub struct RetryableTaskRunner {
    scheduler: Scheduler,
    executor: TaskExecutor,
}

impl RetryableTaskRunner {
    /// Creates a runner on `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            executor: TaskExecutor::new(scheduler.clone()),
            scheduler,
        }
    }

    /// Starts a new retry chain. Returns immediately.
    pub fn execute<T: RetryableTask>(&self, task: Arc<T>, items: Vec<T::Item>, policy: RetryPolicy) {
        self.attempt(ExecutionContext {
            attempts_done: 0,
            items: Arc::new(items),
            policy,
            task,
        });
    }

    fn attempt<T: RetryableTask>(&self, ctx: ExecutionContext<T>) {
        if ctx.task.should_cancel() {
            tracing::debug!(attempts_done = ctx.attempts_done, "task cancelled before attempt");
            let task = Arc::clone(&ctx.task);
            task.cancelled(ctx.into_items());
            return;
        }

        if ctx.attempts_done == 0 {
            ctx.task.before(&ctx.items);
        }

        let task = Arc::clone(&ctx.task);
        let items = Arc::clone(&ctx.items);
        let runner = self.clone();
        self.executor
            .execute(move || task.run(&items), move |result| runner.complete(ctx, result));
    }

    fn complete<T: RetryableTask>(&self, mut ctx: ExecutionContext<T>, result: SyncResult<T::Output>) {
        let task = Arc::clone(&ctx.task);
        match result {
            Ok(output) => task.after(ctx.into_items(), output),
            Err(SyncError::Cancelled) => task.cancelled(ctx.into_items()),
            Err(error) => {
                if ctx.policy.should_retry(error.kind(), ctx.attempts_done) {
                    ctx.attempts_done += 1;
                    let delay = ctx.policy.delay_for_attempt(ctx.attempts_done);
                    tracing::warn!(
                        attempt = ctx.attempts_done,
                        max_retries = ctx.policy.max_retries(),
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "retrying task"
                    );
                    let runner = self.clone();
                    self.scheduler
                        .schedule_after(delay, move || runner.attempt(ctx));
                } else {
                    tracing::error!(
                        attempts = ctx.attempts_done + 1,
                        error = %error,
                        "task failed"
                    );
                    task.error(ctx.into_items(), error);
                }
            }
        }
    }
}
