// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context propagation for futures.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::transmitter::{ReplayGuard, Snapshot, capture};

/// A [`Future`] that runs every poll inside the context it was created in.
///
/// Async runtimes with work-stealing schedulers poll one future on many different threads.
/// `TransmittedFuture` replays its snapshot around each poll and restores the polling thread
/// afterwards, so the future always sees the submitter's context and the runtime's worker
/// threads never keep any of it.
///
/// ```
/// use poolwise::{Slot, TransmittedFuture};
///
/// let user = Slot::new();
/// user.set("alice");
/// let reader = user.clone();
/// let fut = TransmittedFuture::new(async move { reader.get_cloned() });
/// user.remove();
///
/// let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// assert_eq!(runtime.block_on(fut), Some("alice"));
/// assert!(!user.is_set());
/// ```
pub struct TransmittedFuture<F> {
    captured: Snapshot,
    future: F,
}

impl<F> TransmittedFuture<F> {
    /// Wraps `future`, capturing the calling thread's context.
    pub fn new(future: F) -> Self {
        Self::with_snapshot(capture(), future)
    }

    /// Wraps `future` with an existing snapshot.
    pub fn with_snapshot(captured: Snapshot, future: F) -> Self {
        TransmittedFuture { captured, future }
    }

    pub fn captured(&self) -> &Snapshot {
        &self.captured
    }
}

impl<F> Future for TransmittedFuture<F>
where
    F: Future,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `future` is structurally pinned: it is never moved out of `self`, and
        // `TransmittedFuture` implements neither `Drop` nor `Unpin` manually.
        let (captured, future) = unsafe {
            let this = self.get_unchecked_mut();
            (&this.captured, Pin::new_unchecked(&mut this.future))
        };
        let _replayed = ReplayGuard::new(captured);
        future.poll(cx)
    }
}

/// Shorthand for [`TransmittedFuture::new`].
pub fn transmit_future<F: Future>(future: F) -> TransmittedFuture<F> {
    TransmittedFuture::new(future)
}
