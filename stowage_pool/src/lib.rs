//! The stowage worker pool.
//!
//! Flush and rollup work in stowage is fanned out as fire-and-forget tasks
//! onto a fixed set of workers draining a shared FIFO queue. Submission never
//! blocks the caller and never runs a task inline; workers execute tasks with
//! no ordering guarantee between them. There is no priority, no cancellation
//! and no retry: a task is responsible for reporting its own failures.
//!
//! The queue is unbounded. Queue depth is exposed for external monitoring but
//! the pool does not throttle producers.
//!
//! ## Metrics
//!
//! `pool_queue_depth`: Tasks submitted but not yet picked up by a worker

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use metrics::gauge;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::trace;

fn default_workers() -> NonZeroUsize {
    NonZeroUsize::new(100).expect("100 is non-zero")
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Configuration of [`WorkerPool`].
pub struct Config {
    /// The number of workers draining the task queue, 100 by default.
    #[serde(default = "default_workers")]
    pub workers: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Errors produced by [`WorkerPool`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The pool's workers have exited and no further tasks are accepted.
    #[error("worker pool is closed")]
    Closed,
}

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug)]
/// A fixed set of workers draining a FIFO task queue.
///
/// Tasks are owned futures: everything a task needs -- the window timestamp
/// it operates on in particular -- must be moved in by value at submission
/// time, since execution may be arbitrarily delayed.
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<Task>,
    queued: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    workers: usize,
}

impl WorkerPool {
    /// Create a new [`WorkerPool`] with `workers` workers.
    ///
    /// # Panics
    ///
    /// Function will panic if called outside a tokio runtime, as the workers
    /// are spawned onto the current runtime.
    #[must_use]
    pub fn new(workers: NonZeroUsize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));
        let outstanding = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        for id in 0..workers.get() {
            let rx = Arc::clone(&rx);
            let queued = Arc::clone(&queued);
            let outstanding = Arc::clone(&outstanding);
            let idle = Arc::clone(&idle);
            tokio::spawn(async move {
                loop {
                    // Guard scope ends once a task -- or channel closure -- is
                    // handed over, releasing the queue to sibling workers
                    // before the task itself runs.
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task) = task else {
                        trace!(worker = id, "task queue closed, worker exiting");
                        break;
                    };
                    let depth = queued.fetch_sub(1, Ordering::AcqRel) - 1;
                    gauge!("pool_queue_depth").set(depth as f64);
                    task.await;
                    if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        idle.notify_waiters();
                    }
                }
            });
        }

        Self {
            tx,
            queued,
            outstanding,
            idle,
            workers: workers.get(),
        }
    }

    /// Create a new [`WorkerPool`] from a [`Config`].
    ///
    /// # Panics
    ///
    /// See [`WorkerPool::new`].
    #[must_use]
    pub fn new_with_config(config: Config) -> Self {
        Self::new(config.workers)
    }

    /// Enqueue a task and return immediately.
    ///
    /// The task runs on one of the pool's workers at some later point; there
    /// is no ordering guarantee relative to other submitted tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the workers have exited, which only
    /// happens while the owning runtime shuts down.
    pub fn submit<F>(&self, task: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let depth = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(Box::pin(task)).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.idle.notify_waiters();
            }
            return Err(Error::Closed);
        }
        gauge!("pool_queue_depth").set(depth as f64);
        Ok(())
    }

    /// The configured number of workers.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers
    }

    /// Tasks submitted but not yet picked up by a worker.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Wait until the queue is empty and no task is running.
    ///
    /// Used at shutdown to let dispatched work land before the process
    /// exits. Tasks submitted while waiting extend the wait.
    pub async fn until_idle(&self) {
        loop {
            // Register for the idle notification before checking the
            // condition; checking first can miss a wakeup landing between
            // check and registration.
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}
