// SPDX-License-Identifier: MIT OR Apache-2.0

/// Declares static [`Slot`](crate::Slot)s, in the style of [`thread_local!`].
///
/// Each static is created and registered on first use.  With `= expr`, `expr` is the initial
/// value every thread sees until it sets its own; it is evaluated once per thread that reads
/// the slot before setting it.
///
/// ```
/// poolwise::slot! {
///     /// The user a request is running for.
///     pub static USER: String = "anonymous".to_string();
///     static REQUEST_ID: u64;
/// }
///
/// assert_eq!(USER.get().as_deref().map(String::as_str), Some("anonymous"));
/// assert!(REQUEST_ID.get().is_none());
///
/// USER.set("alice".to_string());
/// let snapshot = poolwise::capture();
/// std::thread::spawn(move || {
///     poolwise::run_with_captured(&snapshot, || {
///         assert_eq!(USER.get_cloned().as_deref(), Some("alice"));
///     })
/// })
/// .join()
/// .unwrap();
/// ```
#[macro_export]
macro_rules! slot {
    () => {};
    ($(#[$attr:meta])* $vis:vis static $name:ident: $t:ty = $init:expr; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: ::std::sync::LazyLock<$crate::Slot<$t>> =
            ::std::sync::LazyLock::new(|| {
                $crate::Slot::builder()
                    .name(::core::stringify!($name))
                    .initial(|| $init)
                    .build()
            });
        $crate::slot!($($rest)*);
    };
    ($(#[$attr:meta])* $vis:vis static $name:ident: $t:ty; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: ::std::sync::LazyLock<$crate::Slot<$t>> =
            ::std::sync::LazyLock::new(|| {
                $crate::Slot::builder().name(::core::stringify!($name)).build()
            });
        $crate::slot!($($rest)*);
    };
}

#[cfg(test)]
mod tests {
    crate::slot! {
        static COUNTER: u32 = 7;
        pub(crate) static LABEL: &'static str;
    }

    #[test]
    fn declared_slots_are_named_and_registered() {
        assert_eq!(COUNTER.name(), Some("COUNTER"));
        assert!(COUNTER.is_registered());
        assert_eq!(COUNTER.get().as_deref(), Some(&7));
        assert!(LABEL.get().is_none());
        LABEL.set("set");
        assert!(crate::capture().contains(&*LABEL));
        LABEL.remove();
    }
}
