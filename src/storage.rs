// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-thread slot storage.
//!
//! Every thread owns one map from [`SlotId`] to the value that slot holds on that thread.
//! Nothing here is ever shared between threads; the only cross-thread traffic in the whole
//! engine goes through the registry.
//!
//! None of these functions call user code while the map is borrowed, so initializers, copy
//! functions and `Drop` impls are free to read and write other slots.
//!
//! A dropped slot can only clear its own thread's value directly.  It is also recorded as
//! retired, and every other thread prunes retired ids from its map on its next write.
//! Pruned values are dropped without the slot's cleanup hook, which went away with the slot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, const_mutex};

use crate::registry::ErasedValue;
use crate::slot::SlotId;

/// Every slot dropped so far, oldest first.  Threads sweep the suffix they have not seen.
static RETIRED: Mutex<Vec<SlotId>> = const_mutex(Vec::new());
static RETIRED_LEN: AtomicUsize = AtomicUsize::new(0);

#[derive(Default)]
struct Values {
    map: HashMap<SlotId, ErasedValue>,
    /// How much of `RETIRED` this thread has already swept.
    swept: usize,
}

impl Values {
    fn sweep_retired(&mut self) -> Vec<ErasedValue> {
        if self.swept == RETIRED_LEN.load(Ordering::Acquire) {
            return Vec::new();
        }
        let retired = RETIRED.lock();
        let pruned = retired[self.swept..]
            .iter()
            .filter_map(|id| self.map.remove(id))
            .collect();
        self.swept = retired.len();
        pruned
    }
}

thread_local! {
    static VALUES: RefCell<Values> = RefCell::new(Values::default());
}

/// Returns the calling thread's value for `id`.
///
/// During thread teardown (after the map itself was destroyed) every slot reads as absent.
pub(crate) fn get(id: SlotId) -> Option<ErasedValue> {
    VALUES
        .try_with(|values| values.borrow().map.get(&id).cloned())
        .ok()
        .flatten()
}

/// Installs `value` for `id` on the calling thread, returning what was there before.
pub(crate) fn insert(id: SlotId, value: ErasedValue) -> Option<ErasedValue> {
    let (prior, pruned) = VALUES
        .try_with(|values| {
            let mut values = values.borrow_mut();
            let pruned = values.sweep_retired();
            (values.map.insert(id, value), pruned)
        })
        .ok()?;
    drop(pruned);
    prior
}

/// Removes the calling thread's value for `id`, returning it.
pub(crate) fn remove(id: SlotId) -> Option<ErasedValue> {
    VALUES
        .try_with(|values| values.borrow_mut().map.remove(&id))
        .ok()
        .flatten()
}

/// Marks `id` as gone for good and removes the calling thread's value for it.
///
/// Other threads drop their values for `id` the next time they write any slot.
pub(crate) fn retire(id: SlotId) -> Option<ErasedValue> {
    {
        let mut retired = RETIRED.lock();
        retired.push(id);
        RETIRED_LEN.store(retired.len(), Ordering::Release);
    }
    remove(id)
}

/// Sets (`Some`) or clears (`None`) the calling thread's value, returning the previous one.
pub(crate) fn put(id: SlotId, value: Option<ErasedValue>) -> Option<ErasedValue> {
    match value {
        Some(value) => insert(id, value),
        None => remove(id),
    }
}
