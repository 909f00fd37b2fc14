// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::*;
use crate::registry::{self, ErasedValue, Transmittee};
use crate::slot::Slot;

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
}

/// Counts replays of snapshots captured on an armed thread.
struct ReplayCounter(AtomicUsize);

impl Transmittee for ReplayCounter {
    fn capture(&self) -> Option<ErasedValue> {
        ARMED.with(Cell::get).then(|| Arc::new(()) as ErasedValue)
    }
    fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue> {
        if captured.is_some() {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        None
    }
    fn restore(&self, _prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {}
}

fn address(task: &dyn Runnable) -> *const () {
    task as *const dyn Runnable as *const ()
}

#[test]
fn idempotent_wrap_replays_once() {
    let counter = Arc::new(ReplayCounter(AtomicUsize::new(0)));
    registry::register_transmittee(&counter);
    ARMED.with(|a| a.set(true));
    let wrapped = wrap_runnable(Box::new(|| {}), true);
    ARMED.with(|a| a.set(false));

    let before = address(&*wrapped);
    let again = wrap_runnable(wrapped, true);
    assert_eq!(address(&*again), before, "an existing wrapper is returned as is");
    again.run();
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    registry::unregister_transmittee(&counter);
}

#[test]
fn non_idempotent_wrap_nests_snapshots() {
    let slot = Slot::new();
    let seen = Arc::new(Mutex::new(None));

    slot.set("inner");
    let record = {
        let slot = slot.clone();
        let seen = Arc::clone(&seen);
        move || *seen.lock().unwrap() = slot.get_cloned()
    };
    let inner = wrap_runnable(Box::new(record), false);
    slot.set("outer");
    let outer = wrap_runnable(inner, false);
    assert!(is_wrapped(&*outer));
    assert!(!is_wrapped(&*unwrap_runnable(wrap_runnable(Box::new(|| {}), false))));

    slot.set("runner");
    outer.run();
    assert_eq!(*seen.lock().unwrap(), Some("inner"), "the innermost snapshot wins");
    assert_eq!(slot.get_cloned(), Some("runner"));
}

#[test]
fn unwrap_returns_the_original_task() {
    let plain: Box<dyn Runnable> = Box::new(|| {});
    let original = address(&*plain);
    let unwrapped = unwrap_runnable(wrap_runnable(plain, true));
    assert_eq!(address(&*unwrapped), original);
    assert!(!is_wrapped(&*unwrapped));

    let untouched = unwrap_runnable(unwrapped);
    assert_eq!(address(&*untouched), original, "unwrapping a plain task is a no-op");
}

#[test]
fn absent_task_stays_absent() {
    assert!(wrap_runnable_opt(None, true).is_none());
    assert!(wrap_callable_opt::<u8>(None, false).is_none());
}

#[test]
fn auto_wrappers_are_distinguishable() {
    let explicit = wrap_runnable(Box::new(|| {}), true);
    let explicit_addr = address(&*explicit);
    let still_explicit = auto_wrap_runnable(explicit);
    assert_eq!(address(&*still_explicit), explicit_addr);
    let kept = unwrap_if_auto_wrapper(still_explicit);
    assert!(is_wrapped(&*kept), "explicit wrappers survive auto-unwrapping");

    let plain: Box<dyn Runnable> = Box::new(|| {});
    let plain_addr = address(&*plain);
    let auto = auto_wrap_runnable(plain);
    let wrapper = auto.as_wrapper().expect("auto wrap creates a wrapper");
    assert!(wrapper.is_auto_wrapper());
    assert_eq!(wrapper.get_attachment::<bool>(KEY_IS_AUTO_WRAPPER).as_deref(), Some(&true));
    let back = unwrap_if_auto_wrapper(auto);
    assert_eq!(address(&*back), plain_addr);
}

#[test]
fn attachments_travel_with_the_wrapper() {
    let wrapped = wrap_callable::<u8>(Box::new(|| 1u8), true);
    let wrapper = wrapped.as_wrapper().expect("wrapped");
    wrapper.set_attachment("tenant", String::from("acme"));
    assert_eq!(
        wrapper.get_attachment::<String>("tenant").as_deref().map(String::as_str),
        Some("acme")
    );
    assert!(!wrapper.is_auto_wrapper());
    assert!(wrapper.attachments().remove("tenant"));
    assert!(wrapper.attachments().is_empty());
    assert_eq!(wrapped.call(), 1);
}

#[test]
fn callable_restores_before_failure_reaches_caller() {
    let slot = Slot::new();
    slot.set(1u32);
    let reader = slot.clone();
    let task = wrap_callable::<u32>(
        Box::new(move || -> u32 {
            assert_eq!(reader.get_cloned(), Some(1));
            panic!("computation failed")
        }),
        true,
    );
    slot.set(2);
    let result = panic::catch_unwind(AssertUnwindSafe(|| task.call()));
    assert!(result.is_err());
    assert_eq!(slot.get_cloned(), Some(2));
}

#[test]
fn callable_result_is_returned() {
    let slot = Slot::new();
    slot.set(20u32);
    let reader = slot.clone();
    let tasks = wrap_callables(
        vec![
            Box::new(move || reader.get_cloned().unwrap_or_default() + 1) as Box<dyn Callable<u32>>,
            Box::new(|| 0u32),
        ],
        true,
    );
    slot.remove();
    let results: Vec<u32> = tasks.into_iter().map(|t| t.call()).collect();
    assert_eq!(results, vec![21, 0]);
    assert!(!slot.is_set());
}

#[test]
fn wrapped_callable_is_recognized_until_unwrapped() {
    let plain: Box<dyn Callable<u8>> = Box::new(|| 7u8);
    assert!(!is_wrapped_callable(&*plain));
    let wrapped = wrap_callable(plain, true);
    assert!(is_wrapped_callable(&*wrapped));
    let unwrapped = unwrap_callable(wrapped);
    assert!(!is_wrapped_callable(&*unwrapped));
    assert_eq!(unwrapped.call(), 7);
}

#[test]
fn wrapped_batch_shares_context() {
    let slot = Slot::new();
    slot.set("batch");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let tasks: Vec<Box<dyn Runnable>> = (0..3)
        .map(|_| {
            let slot = slot.clone();
            let seen = Arc::clone(&seen);
            Box::new(move || seen.lock().unwrap().push(slot.get_cloned())) as Box<dyn Runnable>
        })
        .collect();
    let wrapped = wrap_runnables(tasks, true);
    slot.set("changed");

    std::thread::spawn(move || wrapped.into_iter().for_each(|t| t.run()))
        .join()
        .expect("worker should not panic");
    assert_eq!(*seen.lock().unwrap(), vec![Some("batch"); 3]);
}

#[test]
fn recurring_wrapper_replays_each_firing() {
    let slot = Slot::new();
    slot.set(7u8);
    let reader = slot.clone();
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&hits);
    let mut task = wrap_recurring(
        Box::new(move || {
            assert_eq!(reader.get_cloned(), Some(7));
            counted.fetch_add(1, Ordering::SeqCst);
        }),
        true,
    );
    assert!(is_wrapped_recurring(&*task));
    slot.set(8);
    for _ in 0..3 {
        task.fire();
        assert_eq!(slot.get_cloned(), Some(8));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(!is_wrapped_recurring(&*unwrap_recurring(task)));
}

#[test]
fn transmit_carries_context_to_spawned_thread() {
    let slot = Slot::new();
    slot.set(3i32);
    let reader = slot.clone();
    let task = transmit(move || reader.get_cloned());
    let seen = std::thread::spawn(task).join().expect("thread should not panic");
    assert_eq!(seen, Some(3));
}
