// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use super::handle::{ScheduledHandle, TaskHandle};
use super::thread_factory::ThreadFactory;
use super::{Executor, ExecutorService, ScheduledExecutorService};
use crate::error::{ExecutorError, TaskError};
use crate::task::{
    Callable, KEY_IS_AUTO_WRAPPER, Recurring, Runnable, auto_wrap_callable, auto_wrap_recurring,
    auto_wrap_runnable, unwrap_if_auto_wrapper, wrap_callable, wrap_recurring, wrap_runnable,
};
use crate::transmitter::ReplayGuard;

/// Makes every task passed through an executor carry its submitter's context.
///
/// Each task-accepting method wraps the task at the call, on the submitting thread, before
/// handing it to the decorated executor.  Everything else (`shutdown`, status queries,
/// `await_termination`) is delegated as is.  Wrappers inserted here are flagged as
/// auto-inserted, so [`shutdown_now`](ExecutorService::shutdown_now) hands back the caller's
/// original tasks.
///
/// The same type decorates plain executors, executor services and scheduled executor
/// services; it implements whichever of those traits the decorated executor does.
///
/// Two decorators compare equal when the executors they decorate do.
#[derive(Clone)]
pub struct TransmittingExecutor<E> {
    inner: E,
    idempotent: bool,
}

/// A [`TransmittingExecutor`] over a [`ScheduledExecutorService`].
pub type TransmittingScheduledExecutor<E> = TransmittingExecutor<E>;

impl<E> TransmittingExecutor<E> {
    /// Decorates `inner`.  Tasks that already are wrappers are passed through unchanged.
    pub fn new(inner: E) -> Self {
        TransmittingExecutor { inner, idempotent: true }
    }

    /// Whether an already wrapped task is passed through (`true`, the default) or wrapped again.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// The decorated executor.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Removes the decoration, returning the original executor.
    pub fn unwrap(self) -> E {
        self.inner
    }

    fn wrap_runnable(&self, task: Box<dyn Runnable>) -> Box<dyn Runnable> {
        if self.idempotent {
            return auto_wrap_runnable(task);
        }
        let wrapped = wrap_runnable(task, false);
        if let Some(wrapper) = wrapped.as_wrapper() {
            wrapper.set_attachment(KEY_IS_AUTO_WRAPPER, true);
        }
        wrapped
    }

    fn wrap_callable<V: 'static>(&self, task: Box<dyn Callable<V>>) -> Box<dyn Callable<V>> {
        if self.idempotent {
            return auto_wrap_callable(task);
        }
        let wrapped = wrap_callable(task, false);
        if let Some(wrapper) = wrapped.as_wrapper() {
            wrapper.set_attachment(KEY_IS_AUTO_WRAPPER, true);
        }
        wrapped
    }

    fn wrap_recurring(&self, task: Box<dyn Recurring>) -> Box<dyn Recurring> {
        if self.idempotent {
            return auto_wrap_recurring(task);
        }
        let wrapped = wrap_recurring(task, false);
        if let Some(wrapper) = wrapped.as_wrapper() {
            wrapper.set_attachment(KEY_IS_AUTO_WRAPPER, true);
        }
        wrapped
    }
}

impl<E: Executor> Executor for TransmittingExecutor<E> {
    fn execute(&self, task: Box<dyn Runnable>) -> Result<(), ExecutorError> {
        self.inner.execute(self.wrap_runnable(task))
    }
}

impl<E: ExecutorService> ExecutorService for TransmittingExecutor<E> {
    fn submit<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
    ) -> Result<TaskHandle<V>, ExecutorError> {
        self.inner.submit(self.wrap_callable(task))
    }

    fn submit_runnable(&self, task: Box<dyn Runnable>) -> Result<TaskHandle<()>, ExecutorError> {
        self.inner.submit_runnable(self.wrap_runnable(task))
    }

    fn invoke_all<V: Send + 'static>(
        &self,
        tasks: Vec<Box<dyn Callable<V>>>,
    ) -> Result<Vec<TaskHandle<V>>, ExecutorError> {
        let wrapped = tasks.into_iter().map(|task| self.wrap_callable(task)).collect();
        self.inner.invoke_all(wrapped)
    }

    fn invoke_any<V: Send + 'static>(
        &self,
        tasks: Vec<Box<dyn Callable<V>>>,
    ) -> Result<V, TaskError> {
        let wrapped = tasks.into_iter().map(|task| self.wrap_callable(task)).collect();
        self.inner.invoke_any(wrapped)
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }

    fn shutdown_now(&self) -> Vec<Box<dyn Runnable>> {
        self.inner
            .shutdown_now()
            .into_iter()
            .map(unwrap_if_auto_wrapper)
            .collect()
    }

    fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.await_termination(timeout)
    }
}

impl<E: ScheduledExecutorService> ScheduledExecutorService for TransmittingExecutor<E> {
    fn schedule(
        &self,
        task: Box<dyn Runnable>,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.inner.schedule(self.wrap_runnable(task), delay)
    }

    fn schedule_callable<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
        delay: Duration,
    ) -> Result<ScheduledHandle<V>, ExecutorError> {
        self.inner.schedule_callable(self.wrap_callable(task), delay)
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.inner
            .schedule_at_fixed_rate(self.wrap_recurring(task), initial_delay, period)
    }

    fn schedule_with_fixed_delay(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.inner
            .schedule_with_fixed_delay(self.wrap_recurring(task), initial_delay, delay)
    }
}

impl<E: PartialEq> PartialEq for TransmittingExecutor<E> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<E: Eq> Eq for TransmittingExecutor<E> {}

impl<E: Hash> Hash for TransmittingExecutor<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<E: fmt::Debug> fmt::Debug for TransmittingExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittingExecutor")
            .field("inner", &self.inner)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// Decorates `executor` so every task submitted through it carries its submitter's context.
pub fn transmitting_executor<E: Executor>(executor: E) -> TransmittingExecutor<E> {
    TransmittingExecutor::new(executor)
}

/// [`transmitting_executor`] for scheduled executors; delayed and periodic tasks replay the
/// context that was current when they were scheduled.
pub fn transmitting_scheduled_executor<E: ScheduledExecutorService>(
    executor: E,
) -> TransmittingScheduledExecutor<E> {
    TransmittingExecutor::new(executor)
}

/// Creates threads with every registered value cleared on the creating thread.
///
/// The creating thread's context is cleared for the duration of `new_thread` and restored
/// right after, so nothing the decorated factory copies at creation time (for instance an
/// [`InheritingThreadFactory`](crate::InheritingThreadFactory)) reaches the new thread.
///
/// ```
/// use poolwise::{
///     DefaultThreadFactory, InheritingThreadFactory, Slot, ThreadFactory, disable_inheritance,
/// };
///
/// let region = Slot::new();
/// region.set("eu");
/// let reader = region.clone();
/// let factory =
///     disable_inheritance(InheritingThreadFactory::new(DefaultThreadFactory::default()));
/// let (tx, rx) = std::sync::mpsc::channel();
/// factory
///     .new_thread(Box::new(move || tx.send(reader.get_cloned()).unwrap()))
///     .unwrap()
///     .join()
///     .unwrap();
/// assert_eq!(rx.recv().unwrap(), None);
/// assert_eq!(region.get_cloned(), Some("eu"));
/// ```
#[derive(Clone, Default)]
pub struct DisableInheritanceThreadFactory<F> {
    inner: F,
}

impl<F: ThreadFactory> DisableInheritanceThreadFactory<F> {
    pub fn new(inner: F) -> Self {
        DisableInheritanceThreadFactory { inner }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Removes the decoration, returning the original factory.
    pub fn unwrap(self) -> F {
        self.inner
    }
}

impl<F: ThreadFactory> ThreadFactory for DisableInheritanceThreadFactory<F> {
    fn new_thread(&self, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        let _cleared = ReplayGuard::cleared();
        self.inner.new_thread(body)
    }
}

impl<F: PartialEq> PartialEq for DisableInheritanceThreadFactory<F> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<F: Eq> Eq for DisableInheritanceThreadFactory<F> {}

impl<F: Hash> Hash for DisableInheritanceThreadFactory<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<F: fmt::Debug> fmt::Debug for DisableInheritanceThreadFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DisableInheritanceThreadFactory").field(&self.inner).finish()
    }
}

/// Decorates `factory` so new threads never inherit the creating thread's context.
pub fn disable_inheritance<F: ThreadFactory>(factory: F) -> DisableInheritanceThreadFactory<F> {
    DisableInheritanceThreadFactory::new(factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadPool;
    use crate::slot::Slot;
    use crate::task::is_wrapped;
    use std::collections::HashSet;

    #[test]
    fn equality_follows_the_decorated_executor() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let a = transmitting_executor(pool.clone());
        let b = transmitting_executor(pool.clone());
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_eq!(b.unwrap(), pool);
    }

    #[test]
    fn explicit_wrappers_pass_through_unchanged() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let decorated = transmitting_executor(pool);
        let slot = Slot::new();
        slot.set("explicit");
        let reader = slot.clone();
        let explicit = wrap_runnable(
            Box::new(move || assert_eq!(reader.get_cloned(), Some("explicit"))),
            true,
        );
        slot.set("submitter");
        let handle = decorated.submit_runnable(explicit).expect("pool is running");
        assert_eq!(handle.join(), Ok(()));
    }

    #[test]
    fn non_idempotent_decorator_always_wraps() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let decorated = transmitting_executor(pool).idempotent(false);
        assert!(!decorated.is_idempotent());
        let wrapped = decorated.wrap_runnable(wrap_runnable(Box::new(|| {}), true));
        let wrapper = wrapped.as_wrapper().expect("decorator wraps");
        assert!(wrapper.is_auto_wrapper());
        assert!(is_wrapped(&*unwrap_if_auto_wrapper(wrapped)), "the explicit layer remains");
    }
}
