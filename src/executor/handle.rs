// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::task::Callable;

enum State<V> {
    Pending,
    Running,
    Finished(Option<Result<V, TaskError>>),
    Cancelled,
}

/// Shared completion state between a queued task and its handle.
pub(crate) struct Completion<V> {
    state: Mutex<State<V>>,
    changed: Condvar,
}

impl<V> Completion<V> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Completion {
            state: Mutex::new(State::Pending),
            changed: Condvar::new(),
        })
    }

    /// Claims the task for execution.  Returns `false` if it was cancelled first.
    pub(crate) fn start(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Pending => {
                *state = State::Running;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn finish(&self, result: Result<V, TaskError>) {
        let mut state = self.state.lock();
        if matches!(*state, State::Cancelled) {
            return;
        }
        *state = State::Finished(Some(result));
        self.changed.notify_all();
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            State::Pending => {
                *state = State::Cancelled;
                self.changed.notify_all();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), State::Cancelled)
    }

    fn is_done(&self) -> bool {
        matches!(*self.state.lock(), State::Finished(_) | State::Cancelled)
    }

    /// Waits until the task finished or was cancelled.  `false` if `deadline` passed first.
    fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while matches!(*state, State::Pending | State::Running) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return !matches!(*state, State::Pending | State::Running);
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        true
    }

    fn take(&self) -> Result<V, TaskError> {
        match &mut *self.state.lock() {
            State::Finished(result) => result.take().unwrap_or(Err(TaskError::Cancelled)),
            State::Cancelled => Err(TaskError::Cancelled),
            State::Pending | State::Running => Err(TaskError::TimedOut),
        }
    }
}

/// Runs `task` unless `completion` was cancelled, recording its outcome.
pub(crate) fn run_to_completion<V: 'static>(
    completion: &Completion<V>,
    task: Box<dyn Callable<V>>,
) {
    if !completion.start() {
        return;
    }
    let outcome =
        panic::catch_unwind(AssertUnwindSafe(|| task.call())).map_err(TaskError::from_panic);
    if let Err(TaskError::Panicked(message)) = &outcome {
        tracing::warn!(%message, "submitted task panicked");
    }
    completion.finish(outcome);
}

/// A task bound to the completion its handle waits on.
///
/// Dropping it unrun cancels the completion, so a task discarded by `shutdown_now` or a
/// rejecting executor never leaves its handle waiting.
pub(crate) struct Submitted<V> {
    completion: Arc<Completion<V>>,
    task: Option<Box<dyn Callable<V>>>,
}

impl<V: 'static> Submitted<V> {
    pub(crate) fn new(completion: Arc<Completion<V>>, task: Box<dyn Callable<V>>) -> Self {
        Submitted {
            completion,
            task: Some(task),
        }
    }

    pub(crate) fn run(mut self) {
        if let Some(task) = self.task.take() {
            run_to_completion(&self.completion, task);
        }
    }
}

impl<V> Drop for Submitted<V> {
    fn drop(&mut self) {
        if self.task.is_some() && self.completion.cancel() {
            tracing::debug!("queued task dropped before it ran");
        }
    }
}

/// The result of a task submitted to an [`ExecutorService`](crate::ExecutorService).
///
/// Dropping a handle does not cancel the task.
pub struct TaskHandle<V> {
    completion: Arc<Completion<V>>,
}

impl<V> TaskHandle<V> {
    pub(crate) fn new(completion: Arc<Completion<V>>) -> Self {
        TaskHandle { completion }
    }

    /// Waits for the task and returns its value.
    ///
    /// A task that panicked yields [`TaskError::Panicked`]; one cancelled before it started
    /// yields [`TaskError::Cancelled`].
    pub fn join(self) -> Result<V, TaskError> {
        self.completion.wait(None);
        self.completion.take()
    }

    /// Like [`join`](TaskHandle::join), giving up with [`TaskError::TimedOut`] after `timeout`.
    ///
    /// The task keeps running after a timeout.
    pub fn join_timeout(self, timeout: Duration) -> Result<V, TaskError> {
        // a timeout too large to represent never expires
        if self.completion.wait(Instant::now().checked_add(timeout)) {
            self.completion.take()
        } else {
            Err(TaskError::TimedOut)
        }
    }

    /// Returns the outcome if the task is done, or the handle back if it is not.
    pub fn try_join(self) -> Result<Result<V, TaskError>, Self> {
        if self.completion.is_done() {
            Ok(self.completion.take())
        } else {
            Err(self)
        }
    }

    /// Blocks until the task is done without taking its value.
    pub fn wait(&self) {
        self.completion.wait(None);
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Prevents the task from running if it has not started yet.
    ///
    /// Returns `true` if this call cancelled it.  A task that already started runs to
    /// completion.
    pub fn cancel(&self) -> bool {
        self.completion.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }
}

impl<V> fmt::Debug for TaskHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The result of a task given to a [`ScheduledExecutorService`](crate::ScheduledExecutorService).
///
/// Periodic schedules never finish on their own: they end when cancelled, when the executor
/// shuts down, or when a firing panics.
pub struct ScheduledHandle<V> {
    handle: TaskHandle<V>,
    period: Option<Duration>,
}

impl<V> ScheduledHandle<V> {
    pub(crate) fn new(completion: Arc<Completion<V>>, period: Option<Duration>) -> Self {
        ScheduledHandle {
            handle: TaskHandle::new(completion),
            period,
        }
    }

    /// Stops the schedule.  For a one-shot task this only succeeds before it starts.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some()
    }

    /// Waits for a one-shot task's value, or for a periodic schedule to end.
    pub fn join(self) -> Result<V, TaskError> {
        self.handle.join()
    }

    pub fn join_timeout(self, timeout: Duration) -> Result<V, TaskError> {
        self.handle.join_timeout(timeout)
    }
}

impl<V> fmt::Debug for ScheduledHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("period", &self.period)
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
