//! Trailing-edge coalescing of bursty work.

use crate::scheduler::{Scheduler, TimerHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    last_submitted: Instant,
    pending: Option<TimerHandle>,
    generation: u64,
}

/// Collapses a burst of `put` calls into one execution of the most recent
/// task, at most once per `delay`.
///
/// A `put` at least `delay` after the last submission runs immediately.
/// Otherwise it replaces any pending task and is deferred until `delay` has
/// passed since the last submission. The window opens at construction time.
#[derive(Debug, Clone)]
pub struct BatchReporter {
    scheduler: Scheduler,
    delay: Duration,
    window: Arc<Mutex<Window>>,
}

impl BatchReporter {
    /// Creates a reporter on `scheduler`.
    pub fn new(scheduler: Scheduler, delay: Duration) -> Self {
        Self {
            scheduler,
            delay,
            window: Arc::new(Mutex::new(Window {
                last_submitted: Instant::now(),
                pending: None,
                generation: 0,
            })),
        }
    }

    /// Submits `task`, immediately or deferred.
    ///
    /// Once the scheduler is shut down, an immediate task runs inline on the
    /// caller, as a deferred one does when its timer fires.
    pub fn put(&self, task: impl FnOnce() + Send + 'static) {
        let now = Instant::now();
        let mut window = self.window.lock();

        if let Some(pending) = window.pending.take() {
            pending.cancel();
        }
        window.generation = window.generation.wrapping_add(1);

        let elapsed = now.saturating_duration_since(window.last_submitted);
        if elapsed >= self.delay {
            window.last_submitted = now;
            drop(window);
            if let Err(task) = self.scheduler.try_submit(Box::new(task)) {
                tracing::debug!("scheduler closed, running batched task inline");
                task();
            }
            return;
        }

        let generation = window.generation;
        let wait = self.delay - elapsed;
        let shared = Arc::clone(&self.window);
        tracing::debug!(wait_ms = wait.as_millis() as u64, "deferring batched task");

        window.pending = Some(self.scheduler.schedule_after(wait, move || {
            {
                let mut window = shared.lock();
                if window.generation != generation {
                    return;
                }
                window.pending = None;
                window.last_submitted = Instant::now();
            }
            task();
        }));
    }

    /// Returns true while a deferred task is waiting.
    pub fn has_pending(&self) -> bool {
        self.window.lock().pending.is_some()
    }
}
