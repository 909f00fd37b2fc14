// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recursive divide-and-conquer computations on a thread pool.
//!
//! A [`RecursiveTask`] splits itself into subtasks, [`fork`](Forked::fork)s some of them and
//! computes the rest inline.  Every fork point is a new submission: a [`Forked`] task captures
//! the context current *where it is created*, so a subtask forked from inside another task sees
//! the context as it is at that fork, not the root's.
//!
//! [`ForkHandle::join`] runs a subtask inline if no worker has picked it up yet, so a pool
//! never starves itself by having every worker wait on queued work.
//!
//! ```
//! use poolwise::{ForkJoinPool, Forked, RecursiveTask};
//!
//! struct Sum(Vec<u64>);
//!
//! impl RecursiveTask for Sum {
//!     type Output = u64;
//!
//!     fn compute(self, pool: &ForkJoinPool) -> u64 {
//!         if self.0.len() <= 4 {
//!             return self.0.iter().sum();
//!         }
//!         let mut left = self.0;
//!         let right = left.split_off(left.len() / 2);
//!         let right = Forked::new(Sum(right)).fork(pool);
//!         let left = Forked::new(Sum(left)).invoke(pool);
//!         left + right.join()
//!     }
//! }
//!
//! let pool = ForkJoinPool::new(2).unwrap();
//! assert_eq!(pool.invoke(Sum((1..=100).collect())), 5050);
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::ExecutorError;
use crate::executor::{Executor, ExecutorService, ThreadPool, ThreadPoolConfig};
use crate::transmitter::{Snapshot, capture, run_with_captured};

/// A computation that may split itself across a [`ForkJoinPool`].
pub trait RecursiveTask: Send + 'static {
    type Output: Send + 'static;

    /// Computes the result, forking subtasks on `pool` as needed.
    fn compute(self, pool: &ForkJoinPool) -> Self::Output;
}

/// A [`RecursiveTask`] bound to the context current where it was created.
pub struct Forked<T> {
    task: T,
    captured: Snapshot,
}

impl<T: RecursiveTask> Forked<T> {
    /// Captures the calling thread's context for `task`.
    pub fn new(task: T) -> Self {
        Forked {
            task,
            captured: capture(),
        }
    }

    pub fn captured(&self) -> &Snapshot {
        &self.captured
    }

    /// Computes the task on the calling thread, under its captured context.
    pub fn invoke(self, pool: &ForkJoinPool) -> T::Output {
        let Forked { task, captured } = self;
        run_with_captured(&captured, || task.compute(pool))
    }

    /// Schedules the task on `pool` and returns a handle to join it.
    ///
    /// If the pool no longer accepts work, the task is computed when it is joined.
    pub fn fork(self, pool: &ForkJoinPool) -> ForkHandle<T::Output> {
        let slot = Arc::new(ForkSlot {
            state: Mutex::new(ForkState::Pending(Box::new(self))),
            done: Condvar::new(),
        });
        let queued = Arc::clone(&slot);
        let worker_pool = pool.clone();
        let submitted = pool
            .workers
            .execute(Box::new(move || queued.run_if_pending(&worker_pool)));
        if submitted.is_err() {
            tracing::debug!("fork join pool is shut down; fork will run on join");
        }
        ForkHandle {
            slot,
            pool: pool.clone(),
        }
    }
}

impl<T> fmt::Debug for Forked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forked")
            .field("captured", &self.captured)
            .finish_non_exhaustive()
    }
}

/// A forked computation, type-erased to its output.
trait ForkJob<V>: Send {
    fn run(self: Box<Self>, pool: &ForkJoinPool) -> V;
}

impl<T: RecursiveTask> ForkJob<T::Output> for Forked<T> {
    fn run(self: Box<Self>, pool: &ForkJoinPool) -> T::Output {
        self.invoke(pool)
    }
}

enum ForkState<V> {
    Pending(Box<dyn ForkJob<V>>),
    Running,
    Done(thread::Result<V>),
    Taken,
}

struct ForkSlot<V> {
    state: Mutex<ForkState<V>>,
    done: Condvar,
}

impl<V> ForkSlot<V> {
    /// Claims the job if nobody has; the claimer runs it outside the lock.
    fn claim(&self) -> Option<Box<dyn ForkJob<V>>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ForkState::Running) {
            ForkState::Pending(job) => Some(job),
            other => {
                *state = other;
                None
            }
        }
    }

    fn run_if_pending(&self, pool: &ForkJoinPool) {
        if let Some(job) = self.claim() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run(pool)));
            *self.state.lock() = ForkState::Done(outcome);
            self.done.notify_all();
        }
    }

    fn wait(&self) -> thread::Result<V> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, ForkState::Taken) {
                ForkState::Done(outcome) => return outcome,
                other => {
                    *state = other;
                    self.done.wait(&mut state);
                }
            }
        }
    }
}

/// Joins a forked subtask.
#[must_use = "a fork's result is only observed by joining it"]
pub struct ForkHandle<V> {
    slot: Arc<ForkSlot<V>>,
    pool: ForkJoinPool,
}

impl<V> ForkHandle<V> {
    /// Returns the subtask's result, computing it on this thread if no worker started it.
    ///
    /// A panic in the subtask is resumed here.
    pub fn join(self) -> V {
        self.slot.run_if_pending(&self.pool);
        match self.slot.wait() {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.slot.state.lock(), ForkState::Done(_))
    }
}

impl<V> fmt::Debug for ForkHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkHandle").field("done", &self.is_done()).finish()
    }
}

/// A thread pool for [`RecursiveTask`]s.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ForkJoinPool {
    workers: ThreadPool,
}

impl ForkJoinPool {
    pub fn new(parallelism: usize) -> Result<Self, ExecutorError> {
        Self::with_config(
            ThreadPoolConfig::default()
                .workers(parallelism)
                .thread_name("poolwise-fork-join"),
        )
    }

    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, ExecutorError> {
        Ok(ForkJoinPool {
            workers: ThreadPool::with_config(config)?,
        })
    }

    /// Computes `task` on the pool, under the calling thread's context, and waits for it.
    pub fn invoke<T: RecursiveTask>(&self, task: T) -> T::Output {
        Forked::new(task).fork(self).join()
    }

    /// Number of worker threads.
    pub fn parallelism(&self) -> usize {
        self.workers.workers()
    }

    /// Stops accepting forks.  Later forks run when joined.
    pub fn shutdown(&self) {
        self.workers.shutdown();
    }
}
