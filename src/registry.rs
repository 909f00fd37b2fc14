// SPDX-License-Identifier: MIT OR Apache-2.0

//! The process-wide set of propagable values.
//!
//! Everything that [`capture`](crate::capture) reads and [`replay`](crate::replay) writes is
//! found through this registry.  Most entries are [`Slot`](crate::Slot)s, which register
//! themselves when built, but anything implementing [`Transmittee`] can take part: see
//! [`register_transmittee`] for custom sources and [`register_thread_local`] for bridging an
//! existing `thread_local!`.
//!
//! # Ownership
//!
//! The registry never keeps an entry alive.  It holds [`Weak`] references, so a slot whose
//! last handle was dropped simply stops being propagated; its dead entry is pruned on the
//! next registration change.  Whoever declared a transmittee owns it.
//!
//! # Consistency
//!
//! Registration and unregistration are rare; reads happen on every task submission and
//! every task execution.  The entry list is therefore copy-on-write: a read clones one `Arc`
//! under a short spinlock and walks an immutable list, so a capture sees either the whole
//! registry before a concurrent change or the whole registry after it, never a mix.
//!
//! ```
//! use poolwise::Slot;
//!
//! let request_id: Slot<u64> = Slot::new();
//! assert!(request_id.is_registered());
//!
//! request_id.unregister();
//! assert!(!request_id.is_registered());
//!
//! // registering twice is not an error
//! request_id.register();
//! request_id.register();
//! assert!(request_id.is_registered());
//! ```

mod local_key;

use std::any::Any;
use std::sync::{Arc, OnceLock, Weak};

use crate::spinlock::SnapshotCell;

pub use local_key::{
    ThreadLocalRegistration, register_thread_local, register_thread_local_with_copier,
};

/// A type-erased propagated value.
///
/// Values travel from the capturing thread to the replaying thread inside a
/// [`Snapshot`](crate::Snapshot), so they must be shareable across threads.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Something whose per-thread state can be captured on one thread and replayed on another.
///
/// Implementations only ever touch the *calling* thread's state.  The engine guarantees that
/// every `replay` on a thread is followed by exactly one `restore` on that same thread, with
/// any nested replay/restore pairs fully enclosed in between.
pub trait Transmittee: Send + Sync + 'static {
    /// Reads the calling thread's current value, already passed through any copy function.
    ///
    /// Returns `None` when the value is absent and should be propagated as absent.
    /// Must not change the calling thread's state.
    fn capture(&self) -> Option<ErasedValue>;

    /// Installs `captured` on the calling thread (clearing the value when it is `None`) and
    /// returns the value that was there before.
    fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue>;

    /// Puts `prior` back on the calling thread (clearing the value when it is `None`).
    ///
    /// `replayed` is the value the matching [`replay`](Transmittee::replay) installed, so an
    /// implementation can tell it apart from a value the task set while it ran.
    fn restore(&self, prior: Option<ErasedValue>, replayed: Option<&ErasedValue>);

    /// A short label for diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Registry identity of a transmittee: the address of its shared allocation.
///
/// The registry's own `Weak` keeps the allocation from being reused while the key is present.
/// Bridged thread-locals are keyed by their `'static` `LocalKey` instead, so one key is one entry
/// however many bridges are built for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TransmitteeKey(usize);

impl TransmitteeKey {
    pub(crate) fn of<T: ?Sized>(arc: &Arc<T>) -> Self {
        TransmitteeKey(Arc::as_ptr(arc).cast::<()>() as usize)
    }

    pub(crate) fn of_static<T>(value: &'static T) -> Self {
        TransmitteeKey(std::ptr::from_ref(value).cast::<()>() as usize)
    }
}

#[derive(Clone)]
pub(crate) struct Entry {
    pub(crate) key: TransmitteeKey,
    pub(crate) transmittee: Weak<dyn Transmittee>,
}

static REGISTRY: OnceLock<SnapshotCell<Vec<Entry>>> = OnceLock::new();

fn registry() -> &'static SnapshotCell<Vec<Entry>> {
    REGISTRY.get_or_init(|| SnapshotCell::new(Vec::new()))
}

/// Returns every live entry as of this instant.
pub(crate) fn live() -> Vec<(TransmitteeKey, Arc<dyn Transmittee>)> {
    registry()
        .load()
        .iter()
        .filter_map(|entry| entry.transmittee.upgrade().map(|t| (entry.key, t)))
        .collect()
}

pub(crate) fn insert(key: TransmitteeKey, transmittee: Weak<dyn Transmittee>) -> bool {
    let added = registry().update(|entries| {
        let present = entries.iter().any(|e| e.key == key && e.transmittee.strong_count() > 0);
        let mut next: Vec<Entry> = entries
            .iter()
            .filter(|e| e.transmittee.strong_count() > 0)
            .cloned()
            .collect();
        if !present {
            next.push(Entry { key, transmittee });
        }
        (next, !present)
    });
    if added {
        tracing::debug!(?key, "registered transmittee");
    }
    added
}

pub(crate) fn remove(key: TransmitteeKey) -> bool {
    let removed = registry().update(|entries| {
        let removed = entries.iter().any(|e| e.key == key);
        let next: Vec<Entry> = entries
            .iter()
            .filter(|e| e.key != key && e.transmittee.strong_count() > 0)
            .cloned()
            .collect();
        (next, removed)
    });
    if removed {
        tracing::debug!(?key, "unregistered transmittee");
    }
    removed
}

pub(crate) fn contains(key: TransmitteeKey) -> bool {
    registry()
        .load()
        .iter()
        .any(|e| e.key == key && e.transmittee.strong_count() > 0)
}

/// Adds a custom transmittee to the registry.
///
/// Returns `true` if it was newly added, `false` if it was already registered.
/// The registry does not take ownership: keep `transmittee` alive for as long as it should
/// propagate.
///
/// ```
/// use poolwise::{ErasedValue, Transmittee, register_transmittee, unregister_transmittee};
/// use std::sync::Arc;
///
/// /// Propagates a constant marker; useful only as an illustration.
/// struct Marker;
///
/// impl Transmittee for Marker {
///     fn capture(&self) -> Option<ErasedValue> {
///         Some(Arc::new("marker"))
///     }
///     fn replay(&self, _captured: Option<&ErasedValue>) -> Option<ErasedValue> {
///         None
///     }
///     fn restore(&self, _prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {}
/// }
///
/// let marker = Arc::new(Marker);
/// assert!(register_transmittee(&marker));
/// assert!(!register_transmittee(&marker));
/// assert!(unregister_transmittee(&marker));
/// ```
pub fn register_transmittee<T: Transmittee>(transmittee: &Arc<T>) -> bool {
    let weak: Weak<T> = Arc::downgrade(transmittee);
    let weak: Weak<dyn Transmittee> = weak;
    insert(TransmitteeKey::of(transmittee), weak)
}

/// Removes a transmittee from the registry.
///
/// Returns `false` if it was not registered; that is not an error.  Values the transmittee
/// already holds on any thread are left alone; they just stop being propagated.
pub fn unregister_transmittee<T: Transmittee>(transmittee: &Arc<T>) -> bool {
    remove(TransmitteeKey::of(transmittee))
}

/// Number of live registered transmittees.
pub fn registered_count() -> usize {
    registry()
        .load()
        .iter()
        .filter(|e| e.transmittee.strong_count() > 0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl Transmittee for Inert {
        fn capture(&self) -> Option<ErasedValue> {
            None
        }
        fn replay(&self, _captured: Option<&ErasedValue>) -> Option<ErasedValue> {
            None
        }
        fn restore(&self, _prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {}
    }

    #[test]
    fn registration_is_idempotent() {
        let inert = Arc::new(Inert);
        let key = TransmitteeKey::of(&inert);
        assert!(register_transmittee(&inert));
        assert!(!register_transmittee(&inert));
        assert!(contains(key));
        assert_eq!(live().iter().filter(|(k, _)| *k == key).count(), 1);

        assert!(unregister_transmittee(&inert));
        assert!(!unregister_transmittee(&inert));
        assert!(!contains(key));
    }

    #[test]
    fn registry_does_not_own_entries() {
        let inert = Arc::new(Inert);
        let key = TransmitteeKey::of(&inert);
        register_transmittee(&inert);
        let weak = Arc::downgrade(&inert);
        drop(inert);

        assert!(weak.upgrade().is_none(), "registry must not keep the transmittee alive");
        assert!(!contains(key));
        assert!(live().iter().all(|(k, _)| *k != key));
    }

    #[test]
    fn unregistering_unknown_is_noop() {
        let inert = Arc::new(Inert);
        assert!(!unregister_transmittee(&inert));
    }
}
