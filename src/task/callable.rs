// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use super::{Attachments, Wrapper};
use crate::transmitter::{ReplayGuard, Snapshot, capture};

/// A unit of work that runs once and produces a `V`.
///
/// Implemented by every `FnOnce() -> V + Send + 'static` closure.  A failing computation
/// either returns an error value (`V = Result<..>`) or panics; both reach the caller after the
/// worker's context has been restored.
pub trait Callable<V>: Send + 'static {
    fn call(self: Box<Self>) -> V;

    /// `Some` when this task is a context wrapper.
    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        None
    }

    /// Peels off one wrapper layer; a task that is not a wrapper returns itself.
    fn unwrap_task(self: Box<Self>) -> Box<dyn Callable<V>>;
}

impl<V, F> Callable<V> for F
where
    F: FnOnce() -> V + Send + 'static,
    V: 'static,
{
    fn call(self: Box<Self>) -> V {
        (*self)()
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Callable<V>> {
        self
    }
}

/// A [`Callable`] bound to the context that was current when it was created.
pub struct TransmittedCallable<V> {
    task: Box<dyn Callable<V>>,
    captured: Snapshot,
    attachments: Attachments,
}

impl<V: 'static> TransmittedCallable<V> {
    /// Wraps `task`, capturing the calling thread's context.
    pub fn new(task: impl Callable<V>) -> Self {
        Self::from_boxed(Box::new(task))
    }

    pub fn from_boxed(task: Box<dyn Callable<V>>) -> Self {
        TransmittedCallable {
            task,
            captured: capture(),
            attachments: Attachments::new(),
        }
    }

    pub fn inner(&self) -> &dyn Callable<V> {
        &*self.task
    }

    pub fn into_inner(self) -> Box<dyn Callable<V>> {
        self.task
    }
}

impl<V: 'static> Callable<V> for TransmittedCallable<V> {
    fn call(self: Box<Self>) -> V {
        let _replayed = ReplayGuard::new(&self.captured);
        self.task.call()
    }

    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        Some(self)
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Callable<V>> {
        self.task
    }
}

impl<V> Wrapper for TransmittedCallable<V> {
    fn captured(&self) -> &Snapshot {
        &self.captured
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

impl<V> fmt::Debug for TransmittedCallable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittedCallable")
            .field("captured", &self.captured)
            .field("attachments", &self.attachments)
            .finish_non_exhaustive()
    }
}

/// Binds `task` to the calling thread's context; see [`wrap_runnable`](crate::wrap_runnable)
/// for the meaning of `idempotent`.
pub fn wrap_callable<V: 'static>(
    task: Box<dyn Callable<V>>,
    idempotent: bool,
) -> Box<dyn Callable<V>> {
    if idempotent && task.as_wrapper().is_some() {
        return task;
    }
    Box::new(TransmittedCallable::from_boxed(task))
}

pub fn wrap_callable_opt<V: 'static>(
    task: Option<Box<dyn Callable<V>>>,
    idempotent: bool,
) -> Option<Box<dyn Callable<V>>> {
    task.map(|task| wrap_callable(task, idempotent))
}

/// Wraps every task with one capture shared by all of them.
pub fn wrap_callables<V, I>(tasks: I, idempotent: bool) -> Vec<Box<dyn Callable<V>>>
where
    V: 'static,
    I: IntoIterator<Item = Box<dyn Callable<V>>>,
{
    let captured = capture();
    tasks
        .into_iter()
        .map(|task| -> Box<dyn Callable<V>> {
            if idempotent && task.as_wrapper().is_some() {
                return task;
            }
            Box::new(TransmittedCallable {
                task,
                captured: captured.clone(),
                attachments: Attachments::new(),
            })
        })
        .collect()
}

pub fn unwrap_callable<V: 'static>(task: Box<dyn Callable<V>>) -> Box<dyn Callable<V>> {
    task.unwrap_task()
}

pub fn is_wrapped_callable<V: 'static>(task: &dyn Callable<V>) -> bool {
    task.as_wrapper().is_some()
}

/// Wraps `task` unless it already is a wrapper, flagging the new wrapper as auto-inserted.
pub fn auto_wrap_callable<V: 'static>(task: Box<dyn Callable<V>>) -> Box<dyn Callable<V>> {
    if task.as_wrapper().is_some() {
        return task;
    }
    let wrapped = TransmittedCallable::from_boxed(task);
    wrapped.attachments.mark_auto_wrapper();
    Box::new(wrapped)
}

/// Undoes [`auto_wrap_callable`]; explicit wrappers and plain tasks are returned unchanged.
pub fn unwrap_callable_if_auto_wrapper<V: 'static>(
    task: Box<dyn Callable<V>>,
) -> Box<dyn Callable<V>> {
    if task.as_wrapper().is_some_and(|w| w.is_auto_wrapper()) {
        task.unwrap_task()
    } else {
        task
    }
}
