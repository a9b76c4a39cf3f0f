//! Background execution service.
//!
//! All remote-call work runs here: a single dispatcher task drains a job
//! queue and hands each job to the tokio blocking pool, with at most
//! `worker_threads` jobs running at once. Delayed work (retry backoff,
//! batched reports) is a timer that re-enqueues onto the same queue when it
//! fires, so no thread is ever parked waiting for a delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Explicitly owned scheduler handle. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    queue: mpsc::UnboundedSender<Job>,
    shutdown: Arc<Notify>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Scheduler {
    /// Starts a scheduler on the given runtime.
    pub fn new(handle: Handle, worker_threads: usize) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());

        handle.spawn(dispatch(
            handle.clone(),
            jobs,
            worker_threads.max(1),
            Arc::clone(&shutdown),
        ));

        Self {
            inner: Arc::new(Inner {
                handle,
                queue,
                shutdown,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Starts a scheduler on the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current(worker_threads: usize) -> Self {
        Self::new(Handle::current(), worker_threads)
    }

    /// Queues a job for execution.
    ///
    /// Returns false if the scheduler has been shut down; the job is dropped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match self.try_submit(Box::new(job)) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("scheduler closed, dropping job");
                false
            }
        }
    }

    /// Queues a job, handing it back if the scheduler is closed.
    pub(crate) fn try_submit(&self, job: Job) -> Result<(), Job> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(job);
        }
        self.inner.queue.send(job).map_err(|rejected| rejected.0)
    }

    /// Queues a job after `delay` has elapsed.
    ///
    /// The returned handle cancels the timer if it has not fired yet. A timer
    /// that fires after shutdown runs its job inline, so work holding a
    /// completion callback still gets to deliver it.
    pub fn schedule_after(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let scheduler = self.clone();
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(job) = scheduler.try_submit(Box::new(job)) {
                job();
            }
        });
        TimerHandle { task }
    }

    /// Stops accepting jobs.
    ///
    /// Jobs already queued are still dispatched; jobs already running on the
    /// blocking pool finish normally.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("scheduler shutting down");
            self.inner.shutdown.notify_one();
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }
}

/// Cancellation handle for a delayed job.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancels the timer. Has no effect once the job has been queued.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Returns true once the timer has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn dispatch(
    handle: Handle,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    worker_threads: usize,
    shutdown: Arc<Notify>,
) {
    let permits = Arc::new(Semaphore::new(worker_threads));
    tracing::debug!(worker_threads, "scheduler dispatcher started");

    loop {
        let job = tokio::select! {
            _ = shutdown.notified() => {
                jobs.close();
                continue;
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };

        let running = handle.spawn_blocking(move || {
            let _permit = permit;
            job();
        });
        handle.spawn(async move {
            if let Err(error) = running.await {
                tracing::error!(error = %error, "scheduled job panicked");
            }
        });
    }

    tracing::debug!("scheduler dispatcher stopped");
}
