// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context slots: named, typed, per-thread values that follow tasks across threads.
//!
//! A [`Slot`] behaves like a `thread_local!` whose value is *transmitted*: when a task is
//! wrapped, the submitting thread's value is captured, and whichever worker thread later runs
//! the task sees that value for exactly the task's duration.
//!
//! # Values
//!
//! Each thread stores its value as an `Arc<T>`.  [`Slot::get`] hands out a clone of that
//! `Arc`, so reading never copies `T`.  Propagation is governed by two per-slot functions:
//!
//! - the **initializer**, run when a thread reads a slot it never set (like a
//!   `thread_local!` initializer); a slot without one reads as absent, and an absent value
//!   propagates as absent;
//! - the **copy** function, run once at capture time.  The default is a *shadow copy*: the
//!   snapshot shares the submitting thread's very `Arc`.  Supply a copy function when tasks
//!   must not observe later interior mutation by the submitter.
//!
//! An optional **cleanup** hook runs when a value leaves a thread for good: on
//! [`Slot::remove`], and when a task finishes having installed a value of its own, which the
//! restore step then discards.
//!
//! Dropping the last handle of a slot clears the dropping thread's value at once.  Other
//! threads drop theirs the next time they write any slot, without running the cleanup hook.
//!
//! # Identity
//!
//! A slot is identified by its allocation, not by its name or type.  Cloning a `Slot` yields
//! another handle to the same slot.
//!
//! ```
//! use poolwise::Slot;
//!
//! let user = Slot::with_initial(|| String::from("anonymous"));
//! assert_eq!(user.get().as_deref().map(String::as_str), Some("anonymous"));
//!
//! user.set("alice".to_string());
//! assert_eq!(*user.get().unwrap(), "alice");
//!
//! let same = user.clone();
//! assert_eq!(user, same);
//! assert_ne!(user, Slot::with_initial(|| String::from("anonymous")));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::registry::{self, ErasedValue, Transmittee, TransmitteeKey};
use crate::storage;

static SLOT_ID: AtomicU64 = AtomicU64::new(0);

/// Key of a slot in per-thread storage.
///
/// Never reused, so a value left behind on some thread by a dropped slot can never be read
/// through a newer one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SlotId(u64);

impl SlotId {
    pub(crate) fn next() -> Self {
        SlotId(SLOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

type Initializer<T> = Box<dyn Fn() -> T + Send + Sync>;
type Copier<T> = Box<dyn Fn(&T) -> T + Send + Sync>;
type Cleanup<T> = Box<dyn Fn(&T) + Send + Sync>;

struct SlotInner<T> {
    id: SlotId,
    name: Option<String>,
    initial: Option<Initializer<T>>,
    copy: Option<Copier<T>>,
    cleanup: Option<Cleanup<T>>,
}

impl<T: Send + Sync + 'static> SlotInner<T> {
    fn stored(&self) -> Option<Arc<T>> {
        storage::get(self.id).and_then(|v| v.downcast::<T>().ok())
    }

    fn run_cleanup(&self, value: &ErasedValue) {
        if let (Some(cleanup), Some(value)) = (&self.cleanup, value.downcast_ref::<T>()) {
            cleanup(value);
        }
    }
}

impl<T: Send + Sync + 'static> Transmittee for SlotInner<T> {
    fn capture(&self) -> Option<ErasedValue> {
        let current = match self.stored() {
            Some(current) => current,
            None => Arc::new((self.initial.as_ref()?)()),
        };
        Some(match &self.copy {
            Some(copy) => Arc::new(copy(&current)),
            None => current,
        })
    }

    fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue> {
        storage::put(self.id, captured.cloned())
    }

    fn restore(&self, prior: Option<ErasedValue>, replayed: Option<&ErasedValue>) {
        let prior_addr = prior.as_ref().map(|p| Arc::as_ptr(p).cast::<()>());
        let Some(discarded) = storage::put(self.id, prior) else {
            return;
        };
        let installed_by_task = replayed.is_none_or(|r| !Arc::ptr_eq(r, &discarded))
            && prior_addr != Some(Arc::as_ptr(&discarded).cast::<()>());
        if installed_by_task {
            self.run_cleanup(&discarded);
        }
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| std::any::type_name::<T>())
    }
}

impl<T> Drop for SlotInner<T> {
    fn drop(&mut self) {
        drop(storage::retire(self.id));
    }
}

/// A propagable per-thread value.
///
/// See the [module documentation](self) for the propagation model.
pub struct Slot<T> {
    inner: Arc<SlotInner<T>>,
}

impl<T: Send + Sync + 'static> Slot<T> {
    /// Creates and registers a slot with no initializer and shadow-copy propagation.
    ///
    /// Until a thread sets it, the slot reads as absent there.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates and registers a slot whose unset value is produced by `initial`.
    pub fn with_initial<F>(initial: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::builder().initial(initial).build()
    }

    /// Starts configuring a slot.
    pub fn builder() -> SlotBuilder<T> {
        SlotBuilder {
            name: None,
            initial: None,
            copy: None,
            cleanup: None,
        }
    }

    /// Returns the calling thread's value.
    ///
    /// If the thread has no value and the slot has an initializer, the initializer runs and
    /// its result is stored on this thread first.
    pub fn get(&self) -> Option<Arc<T>> {
        if let Some(value) = self.inner.stored() {
            return Some(value);
        }
        let initial = self.inner.initial.as_ref()?;
        let value = Arc::new(initial());
        self.set_arc(Arc::clone(&value));
        Some(value)
    }

    /// Runs `f` with the calling thread's value (see [`get`](Slot::get)).
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let value = self.get();
        f(value.as_deref())
    }

    /// Sets the calling thread's value.
    pub fn set(&self, value: T) {
        self.set_arc(Arc::new(value));
    }

    /// Sets the calling thread's value to an existing shared value.
    pub fn set_arc(&self, value: Arc<T>) {
        let replaced = storage::insert(self.inner.id, value);
        drop(replaced);
    }

    /// Removes the calling thread's value, running the cleanup hook on it.
    ///
    /// Afterwards the slot reads as unset on this thread (so [`get`](Slot::get) will run the
    /// initializer again).
    pub fn remove(&self) {
        if let Some(removed) = storage::remove(self.inner.id) {
            self.inner.run_cleanup(&removed);
        }
    }

    /// Whether the calling thread has a value (without running the initializer).
    pub fn is_set(&self) -> bool {
        storage::get(self.inner.id).is_some()
    }

    /// The diagnostic name given at construction, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Adds this slot to the registry.  Returns `false` if it was already registered.
    ///
    /// Slots register themselves when built; this is only needed after
    /// [`unregister`](Slot::unregister).
    pub fn register(&self) -> bool {
        let weak: Weak<SlotInner<T>> = Arc::downgrade(&self.inner);
        let weak: Weak<dyn Transmittee> = weak;
        registry::insert(self.key(), weak)
    }

    /// Removes this slot from the registry.  Returns `false` if it was not registered.
    ///
    /// Threads that hold a value keep it; it simply stops being captured and replayed.
    pub fn unregister(&self) -> bool {
        registry::remove(self.key())
    }

    /// Whether this slot is currently propagated.
    pub fn is_registered(&self) -> bool {
        registry::contains(self.key())
    }

    pub(crate) fn key(&self) -> TransmitteeKey {
        TransmitteeKey::of(&self.inner)
    }
}

impl<T: Clone + Send + Sync + 'static> Slot<T> {
    /// Returns a clone of the calling thread's value.
    pub fn get_cloned(&self) -> Option<T> {
        self.get().map(|v| T::clone(&v))
    }
}

impl<T: Send + Sync + 'static> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for Slot<T> {}

impl<T> Hash for Slot<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id.0)
            .finish_non_exhaustive()
    }
}

/// Configures a [`Slot`] before registering it.
///
/// ```
/// use poolwise::Slot;
///
/// let trace: Slot<Vec<String>> = Slot::builder()
///     .name("trace")
///     .initial(Vec::new)
///     // each task gets its own copy of the submitter's breadcrumbs
///     .copy(|crumbs: &Vec<String>| crumbs.clone())
///     .build();
/// assert_eq!(trace.name(), Some("trace"));
/// ```
#[must_use = "a slot is only created and registered by `build`"]
pub struct SlotBuilder<T> {
    name: Option<String>,
    initial: Option<Initializer<T>>,
    copy: Option<Copier<T>>,
    cleanup: Option<Cleanup<T>>,
}

impl<T: Send + Sync + 'static> SlotBuilder<T> {
    /// A label used in diagnostics.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Produces the value a thread sees before it sets one.
    pub fn initial<F>(mut self, initial: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.initial = Some(Box::new(initial));
        self
    }

    /// Copies the submitting thread's value at capture time.
    pub fn copy<F>(mut self, copy: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        self.copy = Some(Box::new(copy));
        self
    }

    /// Shares the submitting thread's value with the task instead of copying it (the default).
    pub fn shadow_copy(mut self) -> Self {
        self.copy = None;
        self
    }

    /// Runs when a value leaves a thread for good.
    pub fn cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Creates the slot and registers it for propagation.
    pub fn build(self) -> Slot<T> {
        let slot = Slot {
            inner: Arc::new(SlotInner {
                id: SlotId::next(),
                name: self.name,
                initial: self.initial,
                copy: self.copy,
                cleanup: self.cleanup,
            }),
        };
        slot.register();
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unset_without_initializer_is_absent() {
        let slot: Slot<u32> = Slot::new();
        assert!(slot.get().is_none());
        assert!(!slot.is_set());
        assert!(slot.inner.capture().is_none());
    }

    #[test]
    fn get_stores_initial_value() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let slot = Slot::with_initial(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            5u8
        });
        assert_eq!(slot.get().as_deref(), Some(&5));
        assert_eq!(slot.get().as_deref(), Some(&5));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(slot.is_set());
    }

    #[test]
    fn capture_does_not_store_initial_value() {
        let slot = Slot::with_initial(|| 1u8);
        assert!(slot.inner.capture().is_some());
        assert!(!slot.is_set(), "capture must not mutate the calling thread");
    }

    #[test]
    fn shadow_copy_shares_the_value() {
        let slot = Slot::new();
        slot.set(String::from("shared"));
        let held = slot.get().expect("set above");
        let captured = slot.inner.capture().expect("value is set");
        let captured = captured.downcast::<String>().expect("slot type");
        assert!(Arc::ptr_eq(&held, &captured));
    }

    #[test]
    fn custom_copy_produces_fresh_value() {
        let slot = Slot::builder().copy(|v: &Vec<u8>| v.clone()).build();
        slot.set(vec![1, 2]);
        let held = slot.get().expect("set above");
        let captured = slot.inner.capture().expect("value is set");
        let captured = captured.downcast::<Vec<u8>>().expect("slot type");
        assert_eq!(held, captured);
        assert!(!Arc::ptr_eq(&held, &captured));
    }

    #[test]
    fn remove_runs_cleanup() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleaned);
        let slot = Slot::builder()
            .cleanup(move |v: &usize| {
                counter.fetch_add(*v, Ordering::SeqCst);
            })
            .build();
        slot.remove();
        assert_eq!(cleaned.load(Ordering::SeqCst), 0, "nothing to clean");
        slot.set(3);
        slot.remove();
        assert_eq!(cleaned.load(Ordering::SeqCst), 3);
        assert!(!slot.is_set());
    }

    #[test]
    fn identity_is_by_allocation() {
        use std::collections::HashSet;
        let a: Slot<u8> = Slot::new();
        let b: Slot<u8> = Slot::new();
        let mut set = HashSet::new();
        set.insert(a.clone());
        set.insert(a.clone());
        set.insert(b.clone());
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn dropped_slot_leaves_registry() {
        let slot: Slot<u8> = Slot::new();
        let key = slot.key();
        assert!(registry::contains(key));
        drop(slot);
        assert!(!registry::contains(key));
    }

    #[test]
    fn values_do_not_leak_between_threads() {
        let slot = Slot::new();
        slot.set(1u32);
        let other = slot.clone();
        let seen = std::thread::spawn(move || other.get())
            .join()
            .expect("thread should not panic");
        assert!(seen.is_none());
    }

    #[test]
    fn dropped_slot_frees_values_held_by_other_threads() {
        let slot = Slot::new();
        let payload = Arc::new(());
        let (set_tx, set_rx) = std::sync::mpsc::channel();
        let (dropped_tx, dropped_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let slot = slot.clone();
            let held = Arc::clone(&payload);
            std::thread::spawn(move || {
                let watch = Arc::downgrade(&held);
                slot.set(held);
                drop(slot);
                set_tx.send(()).expect("test is waiting");
                dropped_rx.recv().expect("test drops the slot");
                let before_write = watch.strong_count();
                Slot::new().set(0u8);
                (before_write, watch.strong_count())
            })
        };

        set_rx.recv().expect("worker set its value");
        drop(slot);
        dropped_tx.send(()).expect("worker is waiting");
        let counts = worker.join().expect("worker thread");
        assert_eq!(counts, (2, 1), "the worker's copy goes on its next write");
    }
}
