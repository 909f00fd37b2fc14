// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors surfaced by executors and task handles.
//!
//! The propagation protocol itself has no error type: registering twice, unregistering
//! something unknown and wrapping an already wrapped task are all no-ops, and a panicking
//! initializer or copy function simply unwinds through the caller.

use std::any::Any;
use std::io;

/// A task could not be handed to an executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor has been shut down.
    #[error("executor is shut down; task rejected")]
    Rejected,
    /// A worker or timer thread could not be started.
    #[error("failed to spawn a thread")]
    Spawn(#[source] io::Error),
}

impl From<io::Error> for ExecutorError {
    fn from(err: io::Error) -> Self {
        ExecutorError::Spawn(err)
    }
}

/// A submitted task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before it ran.
    #[error("task was cancelled")]
    Cancelled,
    /// The task panicked; the payload's message, if it had one, is kept.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The wait timed out before the task finished.
    #[error("timed out waiting for task")]
    TimedOut,
    /// The executor refused the task because it is shut down.
    #[error("task was rejected by the executor")]
    Rejected,
    /// `invoke_any` was called with nothing to run.
    #[error("no tasks to invoke")]
    NoTasks,
}

impl TaskError {
    /// Converts a caught panic payload into [`TaskError::Panicked`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        TaskError::Panicked(panic_message(&*payload))
    }
}

/// The message a panic was raised with, when it had one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_message_is_kept() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(TaskError::from_panic(payload), TaskError::Panicked("boom 7".into()));

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(3u8)).unwrap_err();
        assert!(matches!(TaskError::from_panic(payload), TaskError::Panicked(_)));
    }

    #[test]
    fn spawn_error_keeps_source() {
        use std::error::Error;
        let err = ExecutorError::from(io::Error::other("no threads"));
        assert!(err.source().is_some());
    }
}
