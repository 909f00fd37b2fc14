// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crate::transmitter::{capture, run_with_captured};

/// Creates the threads an executor runs its workers on.
pub trait ThreadFactory: Send + Sync {
    /// Starts a new thread running `body`.
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

impl<F: ThreadFactory + ?Sized> ThreadFactory for Arc<F> {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        (**self).new_thread(body)
    }
}

impl<F: ThreadFactory + ?Sized> ThreadFactory for Box<F> {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        (**self).new_thread(body)
    }
}

/// Spawns plainly named threads: `{prefix}-0`, `{prefix}-1`, ...
///
/// New threads start with no slot values, like any freshly spawned thread.
pub struct DefaultThreadFactory {
    prefix: String,
    next: AtomicUsize,
}

impl DefaultThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        DefaultThreadFactory {
            prefix: prefix.into(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for DefaultThreadFactory {
    fn default() -> Self {
        DefaultThreadFactory::new("poolwise-worker")
    }
}

impl ThreadFactory for DefaultThreadFactory {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("{}-{}", self.prefix, n))
            .spawn(body)
    }
}

impl fmt::Debug for DefaultThreadFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultThreadFactory")
            .field("prefix", &self.prefix)
            .field("spawned", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

/// Starts every thread with the context of the thread that created it.
///
/// The creating thread's context is captured in `new_thread` and replayed for the thread's
/// whole life.  For pool workers this means every task sees the context of whoever happened to
/// create the pool, which is usually not what a pool wants; wrap such a factory in
/// [`DisableInheritanceThreadFactory`](crate::DisableInheritanceThreadFactory) to stop it.
///
/// ```
/// use poolwise::{InheritingThreadFactory, Slot, ThreadFactory};
///
/// let region = Slot::new();
/// region.set("eu");
/// let reader = region.clone();
/// let (tx, rx) = std::sync::mpsc::channel();
/// let factory = InheritingThreadFactory::new(poolwise::DefaultThreadFactory::default());
/// factory
///     .new_thread(Box::new(move || tx.send(reader.get_cloned()).unwrap()))
///     .unwrap()
///     .join()
///     .unwrap();
/// assert_eq!(rx.recv().unwrap(), Some("eu"));
/// ```
pub struct InheritingThreadFactory<F> {
    inner: F,
}

impl<F: ThreadFactory> InheritingThreadFactory<F> {
    pub fn new(inner: F) -> Self {
        InheritingThreadFactory { inner }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: ThreadFactory> ThreadFactory for InheritingThreadFactory<F> {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let inherited = capture();
        self.inner
            .new_thread(Box::new(move || run_with_captured(&inherited, body)))
    }
}

impl<F> fmt::Debug for InheritingThreadFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InheritingThreadFactory").finish_non_exhaustive()
    }
}
