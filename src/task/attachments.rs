// SPDX-License-Identifier: MIT OR Apache-2.0

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Attachment key marking a wrapper that an executor decorator inserted on its own.
pub const KEY_IS_AUTO_WRAPPER: &str = "is.auto.wrapper";

/// A string-keyed map of opaque values carried by a task wrapper.
///
/// Values are shared (`Arc`) and typed on read; reading with the wrong type returns `None`.
///
/// ```
/// use poolwise::{TransmittedRunnable, Wrapper};
///
/// let wrapped = TransmittedRunnable::new(|| {});
/// wrapped.attachments().set("origin", "billing");
/// assert_eq!(wrapped.attachments().get::<&str>("origin").as_deref(), Some(&"billing"));
/// assert!(wrapped.attachments().get::<u32>("origin").is_none());
/// ```
#[derive(Default)]
pub struct Attachments {
    values: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.values.write().insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes the value under `key`, returning whether there was one.
    pub fn remove(&self, key: &str) -> bool {
        self.values.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub(crate) fn mark_auto_wrapper(&self) {
        self.set(KEY_IS_AUTO_WRAPPER, true);
    }

    pub(crate) fn is_auto_wrapper(&self) -> bool {
        self.get::<bool>(KEY_IS_AUTO_WRAPPER).is_some_and(|flag| *flag)
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.read();
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        f.debug_struct("Attachments").field("keys", &keys).finish()
    }
}
