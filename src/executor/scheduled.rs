// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::handle::{Completion, ScheduledHandle, Submitted, TaskHandle};
use super::thread_pool::{ThreadPool, ThreadPoolConfig};
use super::{Executor, ExecutorService, ScheduledExecutorService};
use crate::error::{ExecutorError, TaskError};
use crate::task::{Callable, Recurring, Runnable};

#[derive(Clone, Copy, Debug)]
enum Cadence {
    /// next start = previous scheduled start + period
    Rate(Duration),
    /// next start = previous end + delay
    Delay(Duration),
}

/// Beyond any real schedule, well inside what `Instant` can hold.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `from + delay`, clamped to a far-future deadline instead of overflowing.
fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct Periodic {
    task: Box<dyn Recurring>,
    completion: Arc<Completion<()>>,
    cadence: Cadence,
}

// a schedule dropped anywhere without finishing ends as cancelled
impl Drop for Periodic {
    fn drop(&mut self) {
        self.completion.cancel();
    }
}

enum Job {
    Once(Box<dyn Runnable>),
    Periodic(Periodic),
}

struct Entry {
    due: Instant,
    seq: u64,
    job: Job,
}

// BinaryHeap is a max-heap; the earliest (due, seq) must come out first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

struct TimerState {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
    exited: bool,
}

struct Timer {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    exited: Condvar,
}

impl Timer {
    fn schedule(&self, due: Instant, job: Job) -> Result<(), Job> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(job);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry { due, seq, job });
        self.wakeup.notify_one();
        Ok(())
    }

    /// Stops the timer.  Periodic schedules are cancelled; one-shot tasks are either kept
    /// (they still run) or drained and returned.
    fn shutdown(&self, drain_one_shots: bool) -> Vec<Box<dyn Runnable>> {
        let (drained, cancelled) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let mut kept = BinaryHeap::new();
            let mut drained = Vec::new();
            let mut cancelled = Vec::new();
            for entry in std::mem::take(&mut state.queue).into_vec() {
                match entry.job {
                    Job::Periodic(periodic) => cancelled.push(periodic),
                    Job::Once(task) if drain_one_shots => drained.push(task),
                    job @ Job::Once(_) => kept.push(Entry { job, ..entry }),
                }
            }
            state.queue = kept;
            self.wakeup.notify_all();
            (drained, cancelled)
        };
        // user Drop impls run outside the lock
        drop(cancelled);
        drained
    }

    fn next_due(&self) -> Option<Entry> {
        let mut state = self.state.lock();
        loop {
            let due = match state.queue.peek() {
                None if state.shutdown => return None,
                None => {
                    self.wakeup.wait(&mut state);
                    continue;
                }
                Some(entry) => entry.due,
            };
            if due <= Instant::now() {
                return state.queue.pop();
            }
            self.wakeup.wait_until(&mut state, due);
        }
    }
}

fn timer_loop(timer: Arc<Timer>, workers: ThreadPool) {
    while let Some(entry) = timer.next_due() {
        let task: Box<dyn Runnable> = match entry.job {
            Job::Once(task) => task,
            Job::Periodic(periodic) => {
                if periodic.completion.is_cancelled() {
                    continue;
                }
                let timer = Arc::clone(&timer);
                let due = entry.due;
                Box::new(move || fire(periodic, &timer, due))
            }
        };
        if workers.execute(task).is_err() {
            tracing::warn!("scheduled task dropped: worker pool is shut down");
        }
    }
    workers.shutdown();
    timer.state.lock().exited = true;
    timer.exited.notify_all();
    tracing::debug!("scheduler timer exited");
}

fn fire(mut periodic: Periodic, timer: &Timer, scheduled: Instant) {
    if periodic.completion.is_cancelled() {
        return;
    }
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| periodic.task.fire())) {
        let error = TaskError::from_panic(payload);
        tracing::warn!(%error, "periodic task panicked; schedule ends");
        periodic.completion.finish(Err(error));
        return;
    }
    let next = match periodic.cadence {
        Cadence::Rate(period) => deadline_after(scheduled, period),
        Cadence::Delay(delay) => deadline_after(Instant::now(), delay),
    };
    // a rejected reschedule is dropped, which cancels it
    drop(timer.schedule(next, Job::Periodic(periodic)));
}

struct Owner {
    timer: Arc<Timer>,
    workers: ThreadPool,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.timer.shutdown(false);
    }
}

/// A [`ThreadPool`] plus a timer thread for delayed and periodic tasks.
///
/// The timer thread only keeps time; every task runs on a pool worker.  On
/// [`shutdown`](ExecutorService::shutdown), periodic schedules are cancelled and delayed
/// one-shot tasks still run when due; [`shutdown_now`](ExecutorService::shutdown_now) returns
/// them instead.
///
/// ```
/// use std::time::Duration;
/// use poolwise::{ScheduledExecutorService, ScheduledThreadPool};
///
/// let pool = ScheduledThreadPool::new(1).unwrap();
/// let handle = pool
///     .schedule_callable(Box::new(|| "later"), Duration::from_millis(5))
///     .unwrap();
/// assert_eq!(handle.join(), Ok("later"));
/// ```
#[derive(Clone)]
pub struct ScheduledThreadPool {
    owner: Arc<Owner>,
}

impl ScheduledThreadPool {
    pub fn new(workers: usize) -> Result<Self, ExecutorError> {
        Self::with_config(ThreadPoolConfig::default().workers(workers))
    }

    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, ExecutorError> {
        let timer_name = format!("{}-timer", config.thread_name);
        let workers = ThreadPool::with_config(config)?;
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
                exited: false,
            }),
            wakeup: Condvar::new(),
            exited: Condvar::new(),
        });
        let timer_shared = Arc::clone(&timer);
        let timer_workers = workers.clone();
        std::thread::Builder::new()
            .name(timer_name)
            .spawn(move || timer_loop(timer_shared, timer_workers))
            .map_err(|err| {
                workers.shutdown();
                ExecutorError::Spawn(err)
            })?;
        Ok(ScheduledThreadPool {
            owner: Arc::new(Owner { timer, workers }),
        })
    }

    fn timer(&self) -> &Timer {
        &self.owner.timer
    }

    fn workers(&self) -> &ThreadPool {
        &self.owner.workers
    }

    fn schedule_once(&self, task: Box<dyn Runnable>, delay: Duration) -> Result<(), ExecutorError> {
        self.timer()
            .schedule(deadline_after(Instant::now(), delay), Job::Once(task))
            .map_err(|_| ExecutorError::Rejected)
    }

    fn schedule_periodic(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        cadence: Cadence,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        let completion = Completion::new();
        let periodic = Periodic {
            task,
            completion: Arc::clone(&completion),
            cadence,
        };
        let period = match cadence {
            Cadence::Rate(period) | Cadence::Delay(period) => period,
        };
        self.timer()
            .schedule(deadline_after(Instant::now(), initial_delay), Job::Periodic(periodic))
            .map_err(|_| ExecutorError::Rejected)?;
        tracing::debug!(?cadence, "periodic task scheduled");
        Ok(ScheduledHandle::new(completion, Some(period)))
    }

    fn ensure_running(&self) -> Result<(), ExecutorError> {
        if self.timer().state.lock().shutdown {
            Err(ExecutorError::Rejected)
        } else {
            Ok(())
        }
    }
}

impl Executor for ScheduledThreadPool {
    fn execute(&self, task: Box<dyn Runnable>) -> Result<(), ExecutorError> {
        self.ensure_running()?;
        self.workers().execute(task)
    }
}

impl ExecutorService for ScheduledThreadPool {
    fn submit<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
    ) -> Result<TaskHandle<V>, ExecutorError> {
        self.ensure_running()?;
        self.workers().submit(task)
    }

    fn shutdown(&self) {
        self.timer().shutdown(false);
    }

    fn shutdown_now(&self) -> Vec<Box<dyn Runnable>> {
        let mut drained = self.timer().shutdown(true);
        drained.extend(self.workers().shutdown_now());
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.timer().state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        self.timer().state.lock().exited && self.workers().is_terminated()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        {
            let timer = self.timer();
            let mut state = timer.state.lock();
            while !state.exited {
                match deadline {
                    Some(deadline) => {
                        if timer.exited.wait_until(&mut state, deadline).timed_out() {
                            return false;
                        }
                    }
                    None => timer.exited.wait(&mut state),
                }
            }
        }
        let remaining = deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
        self.workers().await_termination(remaining)
    }
}

impl ScheduledExecutorService for ScheduledThreadPool {
    fn schedule(
        &self,
        task: Box<dyn Runnable>,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.schedule_callable(Box::new(move || task.run()), delay)
    }

    fn schedule_callable<V: Send + 'static>(
        &self,
        task: Box<dyn Callable<V>>,
        delay: Duration,
    ) -> Result<ScheduledHandle<V>, ExecutorError> {
        let completion = Completion::new();
        let queued = Submitted::new(Arc::clone(&completion), task);
        self.schedule_once(Box::new(move || queued.run()), delay)?;
        Ok(ScheduledHandle::new(completion, None))
    }

    fn schedule_at_fixed_rate(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.schedule_periodic(task, initial_delay, Cadence::Rate(period))
    }

    fn schedule_with_fixed_delay(
        &self,
        task: Box<dyn Recurring>,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>, ExecutorError> {
        self.schedule_periodic(task, initial_delay, Cadence::Delay(delay))
    }
}

impl PartialEq for ScheduledThreadPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.owner, &other.owner)
    }
}

impl Eq for ScheduledThreadPool {}

impl std::hash::Hash for ScheduledThreadPool {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.owner).hash(state);
    }
}

impl fmt::Debug for ScheduledThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.timer().state.lock();
        f.debug_struct("ScheduledThreadPool")
            .field("workers", &self.workers().workers())
            .field("scheduled", &state.queue.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
