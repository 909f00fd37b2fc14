// SPDX-License-Identifier: MIT OR Apache-2.0

//! Task adapters: units of work bound to the context they were created in.
//!
//! Wrapping a task [`capture`](crate::capture)s the calling thread's context once.  Every
//! time the wrapper runs, that snapshot is replayed around the task body and the worker's
//! own context is restored afterwards, whether the body returns or panics.
//!
//! Three shapes of work are supported:
//!
//! | Trait        | Work                          | Wrapper                  |
//! |--------------|-------------------------------|--------------------------|
//! | [`Runnable`] | run once, no result           | [`TransmittedRunnable`]  |
//! | [`Callable`] | run once, produces a value    | [`TransmittedCallable`]  |
//! | [`Recurring`]| fires any number of times     | [`TransmittedRecurring`] |
//!
//! Closures implement these traits directly.  For typed code that does not need
//! introspection, [`transmit`] is the shortest path:
//!
//! ```
//! use poolwise::{Slot, transmit};
//!
//! let user = Slot::new();
//! user.set("alice");
//! let task = transmit({
//!     let user = user.clone();
//!     move || user.get_cloned()
//! });
//! user.set("bob");
//!
//! let seen = std::thread::spawn(task).join().unwrap();
//! assert_eq!(seen, Some("alice"));
//! ```
//!
//! # Wrappers are explicit
//!
//! Every wrapper answers [`as_wrapper`](Runnable::as_wrapper) with `Some`; plain tasks answer
//! `None`.  That is how [`wrap_runnable`] with `idempotent = true` avoids wrapping twice and how
//! [`unwrap_runnable`] finds the original task.
//!
//! # Attachments
//!
//! A wrapper carries a small string-keyed map, [`Attachments`].  The crate itself uses a single
//! key, [`KEY_IS_AUTO_WRAPPER`], to tell wrappers inserted by an executor decorator apart from
//! wrappers a caller created on purpose; other keys are free for callers.

mod attachments;
mod callable;
mod future;
mod recurring;
mod runnable;
#[cfg(test)]
mod tests;

use crate::transmitter::Snapshot;

pub use attachments::{Attachments, KEY_IS_AUTO_WRAPPER};
pub use callable::{
    Callable, TransmittedCallable, auto_wrap_callable, is_wrapped_callable, unwrap_callable,
    unwrap_callable_if_auto_wrapper, wrap_callable, wrap_callable_opt, wrap_callables,
};
pub use future::{TransmittedFuture, transmit_future};
pub use recurring::{
    Recurring, TransmittedRecurring, auto_wrap_recurring, is_wrapped_recurring, unwrap_recurring,
    unwrap_recurring_if_auto_wrapper, wrap_recurring,
};
pub use runnable::{
    Runnable, TransmittedRunnable, auto_wrap_runnable, is_wrapped, unwrap_if_auto_wrapper,
    unwrap_runnable, wrap_runnable, wrap_runnable_opt, wrap_runnables,
};

/// The capability every task wrapper exposes.
pub trait Wrapper {
    /// The context this wrapper replays on every run.
    fn captured(&self) -> &Snapshot;

    /// Values carried alongside the wrapped task.
    fn attachments(&self) -> &Attachments;
}

impl dyn Wrapper + '_ {
    /// Stores `value` under `key` on this wrapper.
    pub fn set_attachment<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.attachments().set(key, value);
    }

    /// Returns the value stored under `key`, if it has type `T`.
    pub fn get_attachment<T: Send + Sync + 'static>(&self, key: &str) -> Option<std::sync::Arc<T>> {
        self.attachments().get(key)
    }

    /// Whether an executor decorator inserted this wrapper.
    pub fn is_auto_wrapper(&self) -> bool {
        self.attachments().is_auto_wrapper()
    }
}

/// Captures the calling thread's context now and returns `f` bound to it.
///
/// The returned closure replays the captured context while `f` runs, so it can be handed to
/// [`std::thread::spawn`] or any API that takes a plain closure.
pub fn transmit<F, R>(f: F) -> impl FnOnce() -> R + Send + 'static
where
    F: FnOnce() -> R + Send + 'static,
{
    let captured = crate::transmitter::capture();
    move || crate::transmitter::run_with_captured(&captured, f)
}
