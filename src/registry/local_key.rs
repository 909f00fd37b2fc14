// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bridging plain `thread_local!` values into propagation.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::thread::LocalKey;

use super::{ErasedValue, Transmittee, TransmitteeKey};

type Copier<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

struct LocalKeyTransmittee<T: 'static> {
    key: &'static LocalKey<RefCell<Option<T>>>,
    copy: Option<Copier<T>>,
}

impl<T> Transmittee for LocalKeyTransmittee<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn capture(&self) -> Option<ErasedValue> {
        // clone out first: the copier may itself read this thread-local
        let current = self.key.try_with(|cell| cell.borrow().clone()).ok()??;
        let copied = match &self.copy {
            Some(copy) => copy(&current),
            None => current,
        };
        Some(Arc::new(copied))
    }

    fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue> {
        let next = captured.and_then(|v| v.downcast_ref::<T>()).cloned();
        let prior = self.key.try_with(|cell| cell.replace(next)).ok()??;
        Some(Arc::new(prior))
    }

    fn restore(&self, prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {
        let prior = prior
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| Arc::try_unwrap(v).unwrap_or_else(|shared| T::clone(&shared)));
        let discarded = self.key.try_with(|cell| cell.replace(prior));
        drop(discarded);
    }

    fn name(&self) -> &str {
        std::any::type_name::<T>()
    }
}

/// Keeps a bridged `thread_local!` registered for propagation.
///
/// The registry only holds weak references, so this handle is what keeps the bridge alive.
/// Dropping it unregisters the thread-local.
#[must_use = "dropping the registration immediately stops propagation"]
pub struct ThreadLocalRegistration {
    transmittee: Arc<dyn Transmittee>,
    key: TransmitteeKey,
}

impl ThreadLocalRegistration {
    /// Stops propagating the thread-local.  Equivalent to dropping the handle.
    pub fn unregister(self) {
        drop(self);
    }

    /// Whether the bridge is still in the registry.
    pub fn is_registered(&self) -> bool {
        super::contains(self.key)
    }
}

impl Drop for ThreadLocalRegistration {
    fn drop(&mut self) {
        super::remove(self.key);
    }
}

impl fmt::Debug for ThreadLocalRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalRegistration")
            .field("name", &self.transmittee.name())
            .field("registered", &self.is_registered())
            .finish()
    }
}

fn register<T>(
    key: &'static LocalKey<RefCell<Option<T>>>,
    copy: Option<Copier<T>>,
) -> Option<ThreadLocalRegistration>
where
    T: Clone + Send + Sync + 'static,
{
    let transmittee: Arc<dyn Transmittee> = Arc::new(LocalKeyTransmittee { key, copy });
    let registry_key = TransmitteeKey::of_static(key);
    if !super::insert(registry_key, Arc::downgrade(&transmittee)) {
        tracing::debug!(name = transmittee.name(), "thread-local is already registered");
        return None;
    }
    Some(ThreadLocalRegistration {
        transmittee,
        key: registry_key,
    })
}

/// Propagates an existing `thread_local!` the way a [`Slot`](crate::Slot) is propagated.
///
/// `None` in the cell means "absent" and propagates as absent.  Captured values are cloned
/// into the snapshot; use [`register_thread_local_with_copier`] for a custom copy.
///
/// Returns `None` if `key` is already registered; the existing registration stays in charge.
///
/// ```
/// use std::cell::RefCell;
/// use poolwise::{capture, register_thread_local, run_with_captured};
///
/// thread_local! {
///     static TENANT: RefCell<Option<String>> = const { RefCell::new(None) };
/// }
///
/// let registration = register_thread_local(&TENANT).expect("first registration");
/// assert!(register_thread_local(&TENANT).is_none());
/// TENANT.with(|t| *t.borrow_mut() = Some("acme".to_string()));
/// let snapshot = capture();
///
/// let seen = std::thread::spawn(move || {
///     run_with_captured(&snapshot, || TENANT.with(|t| t.borrow().clone()))
/// })
/// .join()
/// .unwrap();
/// assert_eq!(seen.as_deref(), Some("acme"));
/// drop(registration);
/// ```
pub fn register_thread_local<T>(
    key: &'static LocalKey<RefCell<Option<T>>>,
) -> Option<ThreadLocalRegistration>
where
    T: Clone + Send + Sync + 'static,
{
    register(key, None)
}

/// Like [`register_thread_local`], but passes every captured value through `copy`.
pub fn register_thread_local_with_copier<T, C>(
    key: &'static LocalKey<RefCell<Option<T>>>,
    copy: C,
) -> Option<ThreadLocalRegistration>
where
    T: Clone + Send + Sync + 'static,
    C: Fn(&T) -> T + Send + Sync + 'static,
{
    register(key, Some(Box::new(copy)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmitter::{capture, replay, restore};

    thread_local! {
        static COUNTER: RefCell<Option<Vec<u32>>> = const { RefCell::new(None) };
    }

    fn counter() -> Option<Vec<u32>> {
        COUNTER.with(|c| c.borrow().clone())
    }

    #[test]
    fn bridged_value_replays_and_restores() {
        let registration = register_thread_local_with_copier(&COUNTER, |v: &Vec<u32>| {
            let mut copy = v.clone();
            copy.push(0);
            copy
        })
        .expect("not yet registered");
        COUNTER.with(|c| *c.borrow_mut() = Some(vec![1]));
        let snapshot = capture();

        std::thread::spawn(move || {
            COUNTER.with(|c| *c.borrow_mut() = Some(vec![9]));
            let backup = replay(&snapshot);
            assert_eq!(counter(), Some(vec![1, 0]));
            restore(backup);
            assert_eq!(counter(), Some(vec![9]));
        })
        .join()
        .expect("worker should not panic");

        drop(registration);
        let after = capture();
        COUNTER.with(|c| *c.borrow_mut() = None);
        std::thread::spawn(move || {
            let backup = replay(&after);
            assert_eq!(counter(), None, "an unregistered thread-local is not propagated");
            restore(backup);
        })
        .join()
        .expect("worker should not panic");
    }
}
