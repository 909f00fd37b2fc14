// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use super::{Attachments, Wrapper};
use crate::transmitter::{ReplayGuard, Snapshot, capture};

/// A unit of work that runs once and produces nothing.
///
/// Implemented by every `FnOnce() + Send + 'static` closure.
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>);

    /// `Some` when this task is a context wrapper.
    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        None
    }

    /// Peels off one wrapper layer; a task that is not a wrapper returns itself.
    fn unwrap_task(self: Box<Self>) -> Box<dyn Runnable>;
}

impl<F> Runnable for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Runnable> {
        self
    }
}

/// A [`Runnable`] bound to the context that was current when it was created.
pub struct TransmittedRunnable {
    task: Box<dyn Runnable>,
    captured: Snapshot,
    attachments: Attachments,
}

impl TransmittedRunnable {
    /// Wraps `task`, capturing the calling thread's context.
    pub fn new(task: impl Runnable) -> Self {
        Self::from_boxed(Box::new(task))
    }

    pub fn from_boxed(task: Box<dyn Runnable>) -> Self {
        TransmittedRunnable {
            task,
            captured: capture(),
            attachments: Attachments::new(),
        }
    }

    /// The wrapped task.
    pub fn inner(&self) -> &dyn Runnable {
        &*self.task
    }

    pub fn into_inner(self) -> Box<dyn Runnable> {
        self.task
    }
}

impl Runnable for TransmittedRunnable {
    fn run(self: Box<Self>) {
        let _replayed = ReplayGuard::new(&self.captured);
        self.task.run();
    }

    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        Some(self)
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Runnable> {
        self.task
    }
}

impl Wrapper for TransmittedRunnable {
    fn captured(&self) -> &Snapshot {
        &self.captured
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

impl fmt::Debug for TransmittedRunnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittedRunnable")
            .field("captured", &self.captured)
            .field("attachments", &self.attachments)
            .finish_non_exhaustive()
    }
}

/// Binds `task` to the calling thread's context.
///
/// With `idempotent = true` a task that is already a wrapper is returned as is (the very same
/// box).  With `idempotent = false` it is wrapped again, and each layer replays its own
/// snapshot.
///
/// ```
/// use poolwise::{Runnable, is_wrapped, wrap_runnable};
///
/// let task: Box<dyn Runnable> = Box::new(|| println!("hello"));
/// let wrapped = wrap_runnable(task, true);
/// assert!(is_wrapped(&*wrapped));
///
/// let address = &*wrapped as *const dyn Runnable as *const ();
/// let again = wrap_runnable(wrapped, true);
/// assert_eq!(&*again as *const dyn Runnable as *const (), address);
/// again.run();
/// ```
pub fn wrap_runnable(task: Box<dyn Runnable>, idempotent: bool) -> Box<dyn Runnable> {
    if idempotent && task.as_wrapper().is_some() {
        return task;
    }
    Box::new(TransmittedRunnable::from_boxed(task))
}

/// [`wrap_runnable`] for an optional task; `None` stays `None`.
pub fn wrap_runnable_opt(
    task: Option<Box<dyn Runnable>>,
    idempotent: bool,
) -> Option<Box<dyn Runnable>> {
    task.map(|task| wrap_runnable(task, idempotent))
}

/// Wraps every task with one capture shared by all of them.
pub fn wrap_runnables<I>(tasks: I, idempotent: bool) -> Vec<Box<dyn Runnable>>
where
    I: IntoIterator<Item = Box<dyn Runnable>>,
{
    let captured = capture();
    tasks
        .into_iter()
        .map(|task| -> Box<dyn Runnable> {
            if idempotent && task.as_wrapper().is_some() {
                return task;
            }
            Box::new(TransmittedRunnable {
                task,
                captured: captured.clone(),
                attachments: Attachments::new(),
            })
        })
        .collect()
}

/// Removes one wrapper layer.  A task that is not a wrapper is returned unchanged.
pub fn unwrap_runnable(task: Box<dyn Runnable>) -> Box<dyn Runnable> {
    task.unwrap_task()
}

pub fn is_wrapped(task: &dyn Runnable) -> bool {
    task.as_wrapper().is_some()
}

/// Wraps `task` unless it already is a wrapper, flagging the new wrapper as auto-inserted.
///
/// Executor decorators use this so [`unwrap_if_auto_wrapper`] can later hand back the caller's
/// original task.
pub fn auto_wrap_runnable(task: Box<dyn Runnable>) -> Box<dyn Runnable> {
    if task.as_wrapper().is_some() {
        return task;
    }
    let wrapped = TransmittedRunnable::from_boxed(task);
    wrapped.attachments.mark_auto_wrapper();
    Box::new(wrapped)
}

/// Undoes [`auto_wrap_runnable`]; explicit wrappers and plain tasks are returned unchanged.
pub fn unwrap_if_auto_wrapper(task: Box<dyn Runnable>) -> Box<dyn Runnable> {
    if task.as_wrapper().is_some_and(|w| w.is_auto_wrapper()) {
        task.unwrap_task()
    } else {
        task
    }
}
