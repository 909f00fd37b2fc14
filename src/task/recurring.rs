// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use super::{Attachments, Wrapper};
use crate::transmitter::{ReplayGuard, Snapshot, capture};

/// Work that fires repeatedly, such as a timer tick.
///
/// Implemented by every `FnMut() + Send + 'static` closure.
pub trait Recurring: Send + 'static {
    fn fire(&mut self);

    /// `Some` when this task is a context wrapper.
    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        None
    }

    /// Peels off one wrapper layer; a task that is not a wrapper returns itself.
    fn unwrap_task(self: Box<Self>) -> Box<dyn Recurring>;
}

impl<F> Recurring for F
where
    F: FnMut() + Send + 'static,
{
    fn fire(&mut self) {
        self()
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Recurring> {
        self
    }
}

/// A [`Recurring`] task bound to the context that was current when it was created.
///
/// The context is captured once.  Every firing replays that same snapshot, so a recurring
/// task sees the context of whoever scheduled it, not of the moment it fires.
///
/// ```
/// use poolwise::{Recurring, Slot, TransmittedRecurring};
///
/// let tick = Slot::new();
/// tick.set("scheduled");
/// let reader = tick.clone();
/// let mut seen = Vec::new();
/// let (tx, rx) = std::sync::mpsc::channel();
/// let mut task = TransmittedRecurring::new(move || tx.send(reader.get_cloned()).unwrap());
///
/// tick.set("later");
/// task.fire();
/// task.fire();
/// seen.extend(rx.try_iter());
/// assert_eq!(seen, vec![Some("scheduled"), Some("scheduled")]);
/// assert_eq!(tick.get_cloned(), Some("later"));
/// ```
pub struct TransmittedRecurring {
    task: Box<dyn Recurring>,
    captured: Snapshot,
    attachments: Attachments,
}

impl TransmittedRecurring {
    /// Wraps `task`, capturing the calling thread's context.
    pub fn new(task: impl Recurring) -> Self {
        Self::from_boxed(Box::new(task))
    }

    pub fn from_boxed(task: Box<dyn Recurring>) -> Self {
        TransmittedRecurring {
            task,
            captured: capture(),
            attachments: Attachments::new(),
        }
    }

    pub fn inner(&self) -> &dyn Recurring {
        &*self.task
    }

    pub fn into_inner(self) -> Box<dyn Recurring> {
        self.task
    }
}

impl Recurring for TransmittedRecurring {
    fn fire(&mut self) {
        let _replayed = ReplayGuard::new(&self.captured);
        self.task.fire();
    }

    fn as_wrapper(&self) -> Option<&dyn Wrapper> {
        Some(self)
    }

    fn unwrap_task(self: Box<Self>) -> Box<dyn Recurring> {
        self.task
    }
}

impl Wrapper for TransmittedRecurring {
    fn captured(&self) -> &Snapshot {
        &self.captured
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

impl fmt::Debug for TransmittedRecurring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittedRecurring")
            .field("captured", &self.captured)
            .field("attachments", &self.attachments)
            .finish_non_exhaustive()
    }
}

/// Binds `task` to the calling thread's context; see [`wrap_runnable`](crate::wrap_runnable)
/// for the meaning of `idempotent`.
pub fn wrap_recurring(task: Box<dyn Recurring>, idempotent: bool) -> Box<dyn Recurring> {
    if idempotent && task.as_wrapper().is_some() {
        return task;
    }
    Box::new(TransmittedRecurring::from_boxed(task))
}

pub fn unwrap_recurring(task: Box<dyn Recurring>) -> Box<dyn Recurring> {
    task.unwrap_task()
}

pub fn is_wrapped_recurring(task: &dyn Recurring) -> bool {
    task.as_wrapper().is_some()
}

/// Wraps `task` unless it already is a wrapper, flagging the new wrapper as auto-inserted.
pub fn auto_wrap_recurring(task: Box<dyn Recurring>) -> Box<dyn Recurring> {
    if task.as_wrapper().is_some() {
        return task;
    }
    let wrapped = TransmittedRecurring::from_boxed(task);
    wrapped.attachments.mark_auto_wrapper();
    Box::new(wrapped)
}

/// Undoes [`auto_wrap_recurring`]; explicit wrappers and plain tasks are returned unchanged.
pub fn unwrap_recurring_if_auto_wrapper(task: Box<dyn Recurring>) -> Box<dyn Recurring> {
    if task.as_wrapper().is_some_and(|w| w.is_auto_wrapper()) {
        task.unwrap_task()
    } else {
        task
    }
}
