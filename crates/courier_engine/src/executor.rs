//! Single-shot execution of remote calls on the background pool.

use crate::error::{SyncError, SyncResult};
use crate::scheduler::Scheduler;
use crate::transport::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Backend code for a generic server-side failure.
pub const UNKNOWN_BACKEND_ERROR: &str = "UNKNOWN_BACKEND_ERROR";
/// Short backend code for a generic server-side failure.
pub const SERVER_ERROR_CODE: &str = "5xx";
/// Backend code for a semantically invalid request.
pub const INVALID_PARAMETER: &str = "INVALID_PARAMETER";

/// Maps a raw transport failure onto the engine's error taxonomy.
///
/// Backend codes take precedence over HTTP status:
///
/// | Input | Class |
/// |---|---|
/// | code `5xx` / `UNKNOWN_BACKEND_ERROR`, or status 5xx | `TransientBackend` |
/// | code `INVALID_*`, or status 400 | `InvalidParameter` |
/// | everything else | `Unknown` |
pub fn classify(error: TransportError) -> SyncError {
    let message = error.to_string();

    if let Some(code) = error.code.as_deref() {
        if code == SERVER_ERROR_CODE || code == UNKNOWN_BACKEND_ERROR {
            return SyncError::transient(message);
        }
        if code == INVALID_PARAMETER || code.starts_with("INVALID_") {
            return SyncError::invalid_parameter(message);
        }
    }

    match error.status {
        Some(500..=599) => SyncError::transient(message),
        Some(400) => SyncError::invalid_parameter(message),
        _ => SyncError::unknown(message),
    }
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        classify(error)
    }
}

/// Runs a unit of work exactly once on the scheduler.
///
/// The executor has no retry logic and no side effects of its own: it runs
/// the work, then hands the classified result to the completion callback on
/// the same background context.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    scheduler: Scheduler,
}

impl TaskExecutor {
    /// Creates an executor backed by `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    /// Runs `work` in the background and passes its result to `on_complete`.
    ///
    /// If the scheduler rejects the work because it is shut down,
    /// `on_complete` receives [`SyncError::Cancelled`] on the calling thread.
    pub fn execute<T, W, C>(&self, work: W, on_complete: C)
    where
        T: Send + 'static,
        W: FnOnce() -> SyncResult<T> + Send + 'static,
        C: FnOnce(SyncResult<T>) + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Some(on_complete)));
        let queued = Arc::clone(&slot);

        let accepted = self.scheduler.submit(move || {
            let result = work();
            if let Err(e) = &result {
                tracing::debug!(error = %e, kind = ?e.kind(), "task attempt failed");
            }
            let on_complete = queued.lock().take();
            if let Some(on_complete) = on_complete {
                on_complete(result);
            }
        });

        if !accepted {
            let on_complete = slot.lock().take();
            if let Some(on_complete) = on_complete {
                on_complete(Err(SyncError::Cancelled));
            }
        }
    }
}
