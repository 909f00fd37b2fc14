// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::handle::{Completion, Submitted, TaskHandle};
use super::thread_factory::{DefaultThreadFactory, ThreadFactory};
use super::{Executor, ExecutorService};
use crate::error::{ExecutorError, panic_message};
use crate::task::{Callable, Runnable};

/// Configuration for a [`ThreadPool`].
#[derive(Clone)]
pub struct ThreadPoolConfig {
    /// Number of worker threads (at least one is always started).
    pub workers: usize,
    /// Name prefix for workers created by the default factory.
    pub thread_name: String,
    /// Creates the worker threads.  `None` uses a [`DefaultThreadFactory`].
    pub thread_factory: Option<Arc<dyn ThreadFactory>>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            thread_name: "poolwise-worker".to_string(),
            thread_factory: None,
        }
    }
}

impl ThreadPoolConfig {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn thread_factory(mut self, factory: impl ThreadFactory + 'static) -> Self {
        self.thread_factory = Some(Arc::new(factory));
        self
    }
}

impl fmt::Debug for ThreadPoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolConfig")
            .field("workers", &self.workers)
            .field("thread_name", &self.thread_name)
            .field("custom_factory", &self.thread_factory.is_some())
            .finish()
    }
}

struct PoolState {
    queue: VecDeque<Box<dyn Runnable>>,
    shutdown: bool,
    live_workers: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
    terminated: Condvar,
}

impl Shared {
    fn next_task(&self) -> Option<Box<dyn Runnable>> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn shutdown(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.shutdown;
        state.shutdown = true;
        self.available.notify_all();
        first
    }
}

/// Counts a worker out even if the worker body unwinds.
struct WorkerExit<'a>(&'a Shared);

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.live_workers -= 1;
        if state.live_workers == 0 {
            tracing::debug!("thread pool terminated");
            self.0.terminated.notify_all();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let _exit = WorkerExit(&shared);
    while let Some(task) = shared.next_task() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            let message = panic_message(&*payload);
            tracing::warn!(%message, "task panicked on pool worker");
        }
    }
}

/// Shuts the pool down when the last handle is dropped.
struct Owner {
    shared: Arc<Shared>,
    workers: usize,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// A fixed-size pool of worker threads fed from one FIFO queue.
///
/// `ThreadPool` is a cheap handle: clones share the same workers.  Dropping the last handle
/// shuts the pool down gracefully (queued tasks still run).
///
/// The pool itself does not propagate context; decorate it with
/// [`transmitting_executor`](crate::transmitting_executor) for that.
///
/// ```
/// use poolwise::{ExecutorService, ThreadPool};
///
/// let pool = ThreadPool::new(2).unwrap();
/// let handle = pool.submit(Box::new(|| 6 * 7)).unwrap();
/// assert_eq!(handle.join(), Ok(42));
/// pool.shutdown();
/// ```
#[derive(Clone)]
pub struct ThreadPool {
    owner: Arc<Owner>,
}

impl ThreadPool {
    /// Starts a pool with `workers` threads and otherwise default configuration.
    pub fn new(workers: usize) -> Result<Self, ExecutorError> {
        Self::with_config(ThreadPoolConfig::default().workers(workers))
    }

    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, ExecutorError> {
        let workers = config.workers.max(1);
        let factory: Arc<dyn ThreadFactory> = match config.thread_factory {
            Some(factory) => factory,
            None => Arc::new(DefaultThreadFactory::new(config.thread_name)),
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
                live_workers: 0,
            }),
            available: Condvar::new(),
            terminated: Condvar::new(),
        });
        // the owner exists before any worker, so a spawn failure shuts the started ones down
        let owner = Owner {
            shared: Arc::clone(&shared),
            workers,
        };
        for _ in 0..workers {
            shared.state.lock().live_workers += 1;
            let worker_shared = Arc::clone(&shared);
            if let Err(err) = factory.new_thread(Box::new(move || worker_loop(worker_shared))) {
                let mut state = shared.state.lock();
                state.live_workers -= 1;
                if state.live_workers == 0 {
                    shared.terminated.notify_all();
                }
                return Err(ExecutorError::Spawn(err));
            }
        }
        tracing::debug!(workers, "thread pool started");
        Ok(ThreadPool {
            owner: Arc::new(owner),
        })
    }

    /// Number of worker threads the pool was started with.
    pub fn workers(&self) -> usize {
        self.owner.workers
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared().state.lock().queue.len()
    }

    fn shared(&self) -> &Shared {
        &self.owner.shared
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Box<dyn Runnable>) -> Result<(), ExecutorError> {
        let shared = self.shared();
        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(ExecutorError::Rejected);
        }
        state.queue.push_back(task);
        shared.available.notify_one();
        Ok(())
    }
}

impl ExecutorService for ThreadPool {
    fn submit<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
    ) -> Result<TaskHandle<V>, ExecutorError> {
        let completion = Completion::new();
        let queued = Submitted::new(Arc::clone(&completion), task);
        self.execute(Box::new(move || queued.run()))?;
        Ok(TaskHandle::new(completion))
    }

    fn shutdown(&self) {
        if self.shared().shutdown() {
            tracing::debug!("thread pool shutting down");
        }
    }

    fn shutdown_now(&self) -> Vec<Box<dyn Runnable>> {
        self.shutdown();
        let drained: Vec<Box<dyn Runnable>> = self.shared().state.lock().queue.drain(..).collect();
        tracing::debug!(drained = drained.len(), "thread pool stopped");
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.shared().state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.shared().state.lock();
        state.shutdown && state.live_workers == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let shared = self.shared();
        let mut state = shared.state.lock();
        while !(state.shutdown && state.live_workers == 0) {
            match deadline {
                Some(deadline) => {
                    if shared.terminated.wait_until(&mut state, deadline).timed_out() {
                        return state.shutdown && state.live_workers == 0;
                    }
                }
                None => shared.terminated.wait(&mut state),
            }
        }
        true
    }
}

impl PartialEq for ThreadPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.owner, &other.owner)
    }
}

impl Eq for ThreadPool {}

impl std::hash::Hash for ThreadPool {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.owner).hash(state);
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_submitted_work() {
        let pool = ThreadPool::new(3).expect("spawn workers");
        let count = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let count = Arc::clone(&count);
                pool.submit_runnable(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .expect("pool is running")
            })
            .collect();
        for handle in handles {
            handle.join().expect("task should succeed");
        }
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn shutdown_rejects_and_terminates() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(pool.execute(Box::new(|| {})), Err(ExecutorError::Rejected)));
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
    }

    #[test]
    fn shutdown_now_returns_queued_tasks() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            started_tx.send(()).expect("test is waiting");
            let _ = release_rx.recv();
        }))
        .expect("pool is running");
        started_rx.recv().expect("blocker started");
        pool.execute(Box::new(|| {})).expect("pool is running");
        pool.execute(Box::new(|| {})).expect("pool is running");

        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 2);
        release_tx.send(()).expect("blocker is waiting");
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn discarded_submission_cancels_its_handle() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            started_tx.send(()).expect("test is waiting");
            let _ = release_rx.recv();
        }))
        .expect("pool is running");
        started_rx.recv().expect("blocker started");
        let queued = pool.submit(Box::new(|| 3u8)).expect("pool is running");

        drop(pool.shutdown_now());
        release_tx.send(()).expect("blocker is waiting");
        assert_eq!(queued.join_timeout(Duration::from_secs(2)), Err(TaskError::Cancelled));
        assert!(pool.await_termination(Duration::MAX));
    }

    #[test]
    fn worker_survives_panicking_task() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let failed = pool.submit(Box::new(|| -> u8 { panic!("boom") })).expect("pool is running");
        assert!(matches!(failed.join(), Err(TaskError::Panicked(_))));
        let ok = pool.submit(Box::new(|| 1u8)).expect("pool is running");
        assert_eq!(ok.join(), Ok(1));
    }

    #[test]
    fn invoke_any_returns_first_success() {
        let pool = ThreadPool::new(2).expect("spawn workers");
        let tasks: Vec<Box<dyn Callable<u8>>> = vec![
            Box::new(|| -> u8 { panic!("first fails") }),
            Box::new(|| 2u8),
        ];
        assert_eq!(pool.invoke_any(tasks), Ok(2));
        assert_eq!(pool.invoke_any(Vec::<Box<dyn Callable<u8>>>::new()), Err(TaskError::NoTasks));
    }

    #[test]
    fn invoke_all_waits_for_everything() {
        let pool = ThreadPool::new(2).expect("spawn workers");
        let tasks: Vec<Box<dyn Callable<usize>>> = (0..5usize)
            .map(|i| Box::new(move || i * 2) as Box<dyn Callable<usize>>)
            .collect();
        let handles = pool.invoke_all(tasks).expect("pool is running");
        assert!(handles.iter().all(TaskHandle::is_done));
        let values: Vec<usize> = handles
            .into_iter()
            .map(|h| h.join().expect("no failures"))
            .collect();
        assert_eq!(values, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn dropping_last_handle_shuts_down() {
        let pool = ThreadPool::new(1).expect("spawn workers");
        let observer = Arc::clone(&pool.owner.shared);
        drop(pool);
        assert!(observer.state.lock().shutdown);
    }
}
