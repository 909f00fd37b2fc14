// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task-submission surfaces and the decorators that make them propagate context.
//!
//! The traits here are the seams a decorator intercepts: [`Executor`], [`ExecutorService`],
//! [`ScheduledExecutorService`] and [`ThreadFactory`].  [`ThreadPool`] and
//! [`ScheduledThreadPool`] implement them so the crate is usable on its own, but any executor
//! implementing the traits can be decorated.
//!
//! ```
//! use poolwise::{ExecutorService, Slot, ThreadPool, transmitting_executor};
//!
//! let request = Slot::new();
//! let pool = transmitting_executor(ThreadPool::new(2).unwrap());
//!
//! request.set(17u64);
//! let reader = request.clone();
//! let handle = pool.submit(Box::new(move || reader.get_cloned())).unwrap();
//! assert_eq!(handle.join(), Ok(Some(17)));
//! ```

mod decorator;
mod handle;
mod scheduled;
mod thread_factory;
mod thread_pool;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExecutorError, TaskError};
use crate::task::{Callable, Recurring, Runnable};

pub use decorator::{
    DisableInheritanceThreadFactory, TransmittingExecutor, TransmittingScheduledExecutor,
    disable_inheritance, transmitting_executor, transmitting_scheduled_executor,
};
pub use handle::{ScheduledHandle, TaskHandle};
pub use scheduled::ScheduledThreadPool;
pub use thread_factory::{DefaultThreadFactory, InheritingThreadFactory, ThreadFactory};
pub use thread_pool::{ThreadPool, ThreadPoolConfig};

/// Runs tasks, at some point, on some thread.
pub trait Executor: Send + Sync {
    /// Hands `task` over for execution.
    fn execute(&self, task: Box<dyn Runnable>) -> Result<(), ExecutorError>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Box<dyn Runnable>) -> Result<(), ExecutorError> {
        (**self).execute(task)
    }
}

/// An [`Executor`] with task results and a lifecycle.
pub trait ExecutorService: Executor {
    /// Queues `task` and returns a handle to its result.
    fn submit<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
    ) -> Result<TaskHandle<V>, ExecutorError>;

    /// Queues `task` and returns a handle that completes when it has run.
    fn submit_runnable(&self, task: Box<dyn Runnable>) -> Result<TaskHandle<()>, ExecutorError> {
        self.submit(Box::new(move || task.run()))
    }

    /// Runs every task and waits until all of them are done.
    ///
    /// The returned handles are all complete.  If a submission is rejected, the tasks already
    /// submitted are cancelled where possible and the error is returned.
    fn invoke_all<V: Send + 'static>(
        &self,
        tasks: Vec<Box<dyn Callable<V>>>,
    ) -> Result<Vec<TaskHandle<V>>, ExecutorError> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.submit(task) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    handles.iter().for_each(|h| {
                        h.cancel();
                    });
                    return Err(err);
                }
            }
        }
        handles.iter().for_each(TaskHandle::wait);
        Ok(handles)
    }

    /// Runs the tasks and returns the value of the first one to succeed.
    ///
    /// Tasks that have not started by then are cancelled.  If every task fails, the last
    /// failure is returned.
    fn invoke_any<V: Send + 'static>(
        &self,
        tasks: Vec<Box<dyn Callable<V>>>,
    ) -> Result<V, TaskError> {
        if tasks.is_empty() {
            return Err(TaskError::NoTasks);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let mut handles = Vec::with_capacity(tasks.len());
        let mut last_error = None;
        for task in tasks {
            let tx = tx.clone();
            let report = move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.call()))
                    .map_err(TaskError::from_panic);
                // the receiver is gone once another task has won
                let _ = tx.send(outcome);
            };
            match self.submit_runnable(Box::new(report)) {
                Ok(handle) => handles.push(handle),
                Err(_) => {
                    last_error = Some(TaskError::Rejected);
                    break;
                }
            }
        }
        drop(tx);
        let result = loop {
            match rx.recv() {
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(err)) => last_error = Some(err),
                Err(_) => break Err(last_error.unwrap_or(TaskError::Cancelled)),
            }
        };
        handles.iter().for_each(|h| {
            h.cancel();
        });
        result
    }

    /// Stops accepting tasks.  Queued tasks still run.
    fn shutdown(&self);

    /// Stops accepting tasks and returns the ones that never started.
    fn shutdown_now(&self) -> Vec<Box<dyn Runnable>>;

    fn is_shutdown(&self) -> bool;

    /// Whether the executor is shut down and every task has finished.
    fn is_terminated(&self) -> bool;

    /// Waits up to `timeout` for termination.  Returns [`is_terminated`](Self::is_terminated).
    fn await_termination(&self, timeout: Duration) -> bool;
}

/// An [`ExecutorService`] that can run tasks later or periodically.
pub trait ScheduledExecutorService: ExecutorService {
    /// Runs `task` once after `delay`.
    fn schedule(
        &self,
        task: Box<dyn Runnable>,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError>;

    /// Runs `task` once after `delay` and returns its value through the handle.
    fn schedule_callable<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
        delay: Duration,
    ) -> Result<ScheduledHandle<V>, ExecutorError>;

    /// Fires `task` after `initial_delay`, then every `period` measured from each start.
    ///
    /// A firing that overruns its period delays the next one; firings never overlap.
    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError>;

    /// Fires `task` after `initial_delay`, then `delay` after each firing ends.
    fn schedule_with_fixed_delay(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError>;
}
