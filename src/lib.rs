// SPDX-License-Identifier: MIT OR Apache-2.0
/*!
# poolwise

poolwise carries thread-local context across thread pools.

# Development status

poolwise is experimental and the API may change.

# The problem

Thread-local storage and thread pools do not get along.  A worker thread is created once and
then runs thousands of unrelated tasks:

* A value one task leaves in a thread-local is still there when the next task runs on that worker.
* A value the *submitting* thread set (the current user, a request id, a tenant) is invisible to
  the worker that eventually runs the task.

Passing everything as arguments works until a third-party executor sits between you and your
task.  poolwise solves this by moving a consistent snapshot of context along with each task.

# The protocol

Propagable values live in [`Slot`]s.  Every slot is registered in a process-wide registry, and
three functions move all of them at once:

1. [`capture`] takes a [`Snapshot`] of the calling thread's slot values, when a task is created.
2. [`replay`] installs a snapshot on the worker that runs the task and returns a [`Backup`] of
   what the worker had.
3. [`restore`] puts the worker back exactly as it was, after the task returns or panics.

```
use poolwise::{Slot, capture, replay, restore};

let user = Slot::new();
user.set("alice".to_string());
let snapshot = capture();

std::thread::spawn(move || {
    let backup = replay(&snapshot);
    assert_eq!(user.get_cloned().as_deref(), Some("alice"));
    restore(backup);
    assert!(user.get().is_none());
})
.join()
.unwrap();
```

A slot the worker had no value for is *absent* again after [`restore`], not set to some default.

# Tasks and executors

Calling the protocol by hand is rarely necessary:

* The task adapters in [`task`] wrap a unit of work so it captures once and replays around every
  run: [`wrap_runnable`], [`wrap_callable`], [`wrap_recurring`], [`transmit`] and
  [`transmit_future`].
* The decorators in [`executor`] wrap an entire [`Executor`], [`ExecutorService`] or
  [`ScheduledExecutorService`] so every task submitted through them is adapted:
  [`transmitting_executor`], [`transmitting_scheduled_executor`].
* [`disable_inheritance`] wraps a [`ThreadFactory`] so new workers start with no context.
* [`fork_join`] runs recursive computations where every fork point captures anew.

```
use poolwise::{ExecutorService, Slot, ThreadPool, transmitting_executor};

let tenant = Slot::new();
let pool = transmitting_executor(ThreadPool::new(2).unwrap());

tenant.set("acme");
let reader = tenant.clone();
let seen = pool.submit(Box::new(move || reader.get_cloned())).unwrap();
assert_eq!(seen.join(), Ok(Some("acme")));
```

# Other context sources

Anything that implements [`Transmittee`] can be registered and propagated alongside slots.
[`register_thread_local`] bridges an existing `thread_local!` without changing its declaration.

# Logging

poolwise emits [`tracing`](https://docs.rs/tracing) events: `trace` for protocol steps,
`debug` for executor lifecycle and `warn` when a task or a restore step panics.  Install a
subscriber to see them.
*/

mod error;
pub mod executor;
pub mod fork_join;
mod macros;
mod registry;
mod slot;
mod spinlock;
mod storage;
pub mod task;
mod transmitter;

pub use error::{ExecutorError, TaskError};
pub use executor::{
    DefaultThreadFactory, DisableInheritanceThreadFactory, Executor, ExecutorService,
    InheritingThreadFactory, ScheduledExecutorService, ScheduledHandle, ScheduledThreadPool,
    TaskHandle, ThreadFactory, ThreadPool, ThreadPoolConfig, TransmittingExecutor,
    TransmittingScheduledExecutor, disable_inheritance, transmitting_executor,
    transmitting_scheduled_executor,
};
pub use fork_join::{ForkHandle, ForkJoinPool, Forked, RecursiveTask};
pub use registry::{
    ErasedValue, ThreadLocalRegistration, Transmittee, register_thread_local,
    register_thread_local_with_copier, register_transmittee, registered_count,
    unregister_transmittee,
};
pub use slot::{Slot, SlotBuilder};
pub use task::{
    Attachments, Callable, KEY_IS_AUTO_WRAPPER, Recurring, Runnable, TransmittedCallable,
    TransmittedFuture, TransmittedRecurring, TransmittedRunnable, Wrapper, auto_wrap_callable,
    auto_wrap_recurring, auto_wrap_runnable, is_wrapped, is_wrapped_callable, is_wrapped_recurring,
    transmit, transmit_future, unwrap_callable, unwrap_callable_if_auto_wrapper,
    unwrap_if_auto_wrapper, unwrap_recurring, unwrap_recurring_if_auto_wrapper, unwrap_runnable,
    wrap_callable, wrap_callable_opt, wrap_callables, wrap_recurring, wrap_runnable,
    wrap_runnable_opt, wrap_runnables,
};
pub use transmitter::{
    Backup, ReplayGuard, Snapshot, capture, clear, replay, restore, run_with_captured,
    run_with_cleared,
};
