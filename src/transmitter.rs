// SPDX-License-Identifier: MIT OR Apache-2.0

//! The capture / replay / restore protocol.
//!
//! This is the low-level interface the task adapters are built on.  Most code should use
//! [`wrap_runnable`](crate::wrap_runnable), [`transmit`](crate::transmit) or an executor
//! decorator instead, but the protocol is public for callers building their own adapters.
//!
//! ```
//! use poolwise::{Slot, capture, replay, restore};
//!
//! let user = Slot::new();
//! user.set("alice");
//! let snapshot = capture();
//!
//! std::thread::spawn(move || {
//!     user.set("worker");
//!     let backup = replay(&snapshot);
//!     assert_eq!(*user.get().unwrap(), "alice");
//!     restore(backup);
//!     assert_eq!(*user.get().unwrap(), "worker");
//! })
//! .join()
//! .unwrap();
//! ```
//!
//! # Guarantees
//!
//! - [`capture`] never changes the calling thread's state.
//! - [`replay`] applies a snapshot completely or not at all.  If a transmittee panics part-way
//!   through, everything already applied is rolled back before the panic continues.
//! - [`restore`] must run on the thread that called `replay`; [`Backup`] is `!Send`, so the
//!   compiler enforces this.  It consumes the backup, so it cannot run twice.
//! - [`ReplayGuard`] ties `restore` to scope exit, unwinding included.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::registry::{self, ErasedValue, Transmittee, TransmitteeKey};
use crate::slot::Slot;

struct Captured {
    key: TransmitteeKey,
    transmittee: Weak<dyn Transmittee>,
    value: ErasedValue,
}

/// An immutable capture of every registered value on one thread at one instant.
///
/// Slots that were absent (unset and without an initializer) are not in the snapshot, and
/// replaying it clears them.  Cloning is cheap; all clones share one allocation.
#[derive(Clone)]
pub struct Snapshot {
    entries: Arc<[Captured]>,
}

impl Snapshot {
    /// A snapshot with no values.  Replaying it clears every registered slot.
    pub fn empty() -> Self {
        Snapshot {
            entries: Arc::from(Vec::new()),
        }
    }

    /// Number of captured values.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `slot` had a value when this snapshot was taken.
    pub fn contains<T: Send + Sync + 'static>(&self, slot: &Slot<T>) -> bool {
        self.find(slot.key()).is_some()
    }

    /// The value `slot` had (after its copy function) when this snapshot was taken.
    pub fn get<T: Send + Sync + 'static>(&self, slot: &Slot<T>) -> Option<Arc<T>> {
        let value = Arc::clone(self.find(slot.key())?);
        value.downcast::<T>().ok()
    }

    fn find(&self, key: TransmitteeKey) -> Option<&ErasedValue> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("len", &self.len()).finish()
    }
}

struct Restore {
    transmittee: Arc<dyn Transmittee>,
    prior: Option<ErasedValue>,
    replayed: Option<ErasedValue>,
}

/// What a thread held before a [`replay`]; hand it to [`restore`] on the same thread.
#[must_use = "a backup that is never restored leaves the replayed context on this thread"]
pub struct Backup {
    entries: Vec<Restore>,
    // restore must happen on the replaying thread
    _thread: PhantomData<*const ()>,
}

impl Backup {
    /// Number of values this backup will put back (or clear).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Backup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backup").field("len", &self.len()).finish()
    }
}

/// Reads every registered value on the calling thread.
///
/// Each value passes through its slot's copy function.  An unset slot with an initializer
/// contributes its initial value; an unset slot without one is left out.
pub fn capture() -> Snapshot {
    let entries: Vec<Captured> = registry::live()
        .into_iter()
        .filter_map(|(key, transmittee)| {
            let value = transmittee.capture()?;
            Some(Captured {
                key,
                transmittee: Arc::downgrade(&transmittee),
                value,
            })
        })
        .collect();
    tracing::trace!(values = entries.len(), "captured context");
    Snapshot {
        entries: Arc::from(entries),
    }
}

/// Rolls back a partially applied replay if a transmittee panics.
struct Rollback(Vec<Restore>);

impl Drop for Rollback {
    fn drop(&mut self) {
        if let Some(payload) = restore_entries(std::mem::take(&mut self.0)) {
            // already unwinding from the replay panic
            drop(payload);
        }
    }
}

/// Installs `snapshot` on the calling thread and returns what was there before.
///
/// Every slot in the snapshot is set to its captured value.  Every registered slot *not* in
/// the snapshot is cleared, so leftovers from an earlier task on this thread are not visible.
pub fn replay(snapshot: &Snapshot) -> Backup {
    let mut targets: Vec<(Arc<dyn Transmittee>, Option<&ErasedValue>)> = snapshot
        .entries
        .iter()
        .filter_map(|c| c.transmittee.upgrade().map(|t| (t, Some(&c.value))))
        .collect();
    for (key, transmittee) in registry::live() {
        if snapshot.find(key).is_none() {
            targets.push((transmittee, None));
        }
    }

    let mut applied = Rollback(Vec::with_capacity(targets.len()));
    for (transmittee, value) in targets {
        let prior = transmittee.replay(value);
        applied.0.push(Restore {
            transmittee,
            prior,
            replayed: value.cloned(),
        });
    }
    let entries = std::mem::take(&mut applied.0);
    tracing::trace!(values = snapshot.len(), restorable = entries.len(), "replayed context");
    Backup {
        entries,
        _thread: PhantomData,
    }
}

/// Returns the calling thread to the state recorded in `backup`.
///
/// Entries are restored in reverse replay order.  If a transmittee panics, the remaining
/// entries are still restored and the first panic is then resumed.
pub fn restore(backup: Backup) {
    let restored = backup.len();
    if let Some(payload) = restore_entries(backup.entries) {
        panic::resume_unwind(payload);
    }
    tracing::trace!(restored, "restored context");
}

fn restore_entries(mut entries: Vec<Restore>) -> Option<Box<dyn Any + Send>> {
    let mut first_panic = None;
    while let Some(entry) = entries.pop() {
        let Restore {
            transmittee,
            prior,
            replayed,
        } = entry;
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            transmittee.restore(prior, replayed.as_ref());
        }));
        if let Err(payload) = outcome {
            first_panic.get_or_insert(payload);
        }
    }
    first_panic
}

/// Clears every registered value on the calling thread, returning a backup of them.
///
/// Equivalent to `replay(&Snapshot::empty())`.
pub fn clear() -> Backup {
    replay(&Snapshot::empty())
}

/// Runs `f` with `snapshot` replayed on the calling thread, restoring afterwards.
pub fn run_with_captured<R>(snapshot: &Snapshot, f: impl FnOnce() -> R) -> R {
    let _guard = ReplayGuard::new(snapshot);
    f()
}

/// Runs `f` with every registered value cleared on the calling thread, restoring afterwards.
pub fn run_with_cleared<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ReplayGuard::cleared();
    f()
}

/// Replays a snapshot for the lifetime of the guard.
///
/// The backup is restored when the guard drops, including when the scope is left by a panic.
///
/// ```
/// use poolwise::{ReplayGuard, Slot, Snapshot};
///
/// let slot = Slot::new();
/// slot.set(1);
/// {
///     let _guard = ReplayGuard::new(&Snapshot::empty());
///     assert!(slot.get().is_none());
/// }
/// assert_eq!(slot.get().as_deref(), Some(&1));
/// ```
#[must_use = "the snapshot is restored as soon as the guard drops"]
pub struct ReplayGuard {
    backup: Option<Backup>,
}

impl ReplayGuard {
    pub fn new(snapshot: &Snapshot) -> Self {
        ReplayGuard {
            backup: Some(replay(snapshot)),
        }
    }

    /// A guard over [`clear`].
    pub fn cleared() -> Self {
        ReplayGuard {
            backup: Some(clear()),
        }
    }
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        let Some(backup) = self.backup.take() else {
            return;
        };
        if let Some(payload) = restore_entries(backup.entries) {
            if std::thread::panicking() {
                tracing::warn!("restore panicked while unwinding; dropping the second panic");
                drop(payload);
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayGuard").field("backup", &self.backup).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn round_trip_is_noop() {
        let set: Slot<String> = Slot::new();
        let unset: Slot<u8> = Slot::new();
        let initial = Slot::with_initial(|| 9u16);
        set.set("mine".into());
        let held = set.get().expect("set above");

        let backup = replay(&capture());
        restore(backup);

        assert!(Arc::ptr_eq(&held, &set.get().expect("still set")));
        assert!(!unset.is_set());
        assert_eq!(initial.get().as_deref(), Some(&9));
    }

    #[test]
    fn absence_clears_and_comes_back() {
        let slot: Slot<&str> = Slot::new();
        let snapshot = capture();
        assert!(!snapshot.contains(&slot));

        slot.set("worker");
        let backup = replay(&snapshot);
        assert!(!slot.is_set(), "absent at capture means absent during the task");
        restore(backup);
        assert_eq!(slot.get().as_deref(), Some(&"worker"));
    }

    #[test]
    fn snapshot_is_immutable() {
        let slot = Slot::new();
        slot.set(1u32);
        let snapshot = capture();
        slot.set(2);
        assert_eq!(snapshot.get(&slot).as_deref(), Some(&1));
    }

    #[test]
    fn unregistered_slot_is_not_captured() {
        let slot = Slot::new();
        slot.set(1u32);
        slot.unregister();
        assert!(!capture().contains(&slot));
        slot.register();
        assert!(capture().contains(&slot));
    }

    #[test]
    fn clear_then_restore_is_noop() {
        let slot = Slot::new();
        slot.set(5i64);
        let backup = clear();
        assert!(!slot.is_set());
        restore(backup);
        assert_eq!(slot.get().as_deref(), Some(&5));
    }

    #[test]
    fn guard_restores_on_panic() {
        let slot = Slot::new();
        slot.set("before");
        let snapshot = capture();

        slot.set("worker");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_with_captured(&snapshot, || {
                assert_eq!(slot.get().as_deref(), Some(&"before"));
                panic!("task failed");
            })
        }));
        assert!(result.is_err());
        assert_eq!(slot.get().as_deref(), Some(&"worker"));
    }

    #[test]
    fn cleanup_runs_only_for_values_the_task_installed() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let slot = Slot::builder()
            .cleanup(move |_: &u8| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        slot.set(1);
        let snapshot = capture();

        run_with_captured(&snapshot, || {});
        assert_eq!(cleaned.load(Ordering::SeqCst), 0, "replayed value is not the task's");

        run_with_captured(&snapshot, || slot.set(2));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert_eq!(slot.get().as_deref(), Some(&1));
    }

    thread_local! {
        static ARMED: Cell<bool> = const { Cell::new(false) };
    }

    /// Panics when replaying a value it captured on an armed thread.
    struct Tripwire;

    impl Transmittee for Tripwire {
        fn capture(&self) -> Option<ErasedValue> {
            ARMED.with(Cell::get).then(|| Arc::new(()) as ErasedValue)
        }
        fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue> {
            assert!(captured.is_none(), "tripwire");
            None
        }
        fn restore(&self, _prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {}
    }

    #[test]
    fn failed_replay_is_rolled_back() {
        let slot = Slot::new();
        slot.set("captured");
        let tripwire = Arc::new(Tripwire);
        registry::register_transmittee(&tripwire);
        ARMED.with(|a| a.set(true));
        let snapshot = capture();
        ARMED.with(|a| a.set(false));

        slot.set("worker");
        let result = panic::catch_unwind(AssertUnwindSafe(|| replay(&snapshot)));
        assert!(result.is_err());
        assert_eq!(slot.get().as_deref(), Some(&"worker"));
        registry::unregister_transmittee(&tripwire);
    }
}
