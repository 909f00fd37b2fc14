use poolwise::{
    ErasedValue, Slot, Transmittee, capture, register_thread_local,
    register_thread_local_with_copier, register_transmittee, registered_count, run_with_captured,
    unregister_transmittee,
};
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Mutex};
use std::thread;

// tests in this file observe the process-wide registry size
static REGISTRY_GUARD: Mutex<()> = Mutex::new(());

thread_local! {
    static DEADLINE_MS: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Propagates a per-thread request deadline that lives outside any slot.
struct Deadline;

impl Transmittee for Deadline {
    fn capture(&self) -> Option<ErasedValue> {
        DEADLINE_MS.with(Cell::get).map(|ms| Arc::new(ms) as ErasedValue)
    }

    fn replay(&self, captured: Option<&ErasedValue>) -> Option<ErasedValue> {
        let next = captured.and_then(|v| v.downcast_ref::<u64>()).copied();
        DEADLINE_MS.with(|d| d.replace(next)).map(|ms| Arc::new(ms) as ErasedValue)
    }

    fn restore(&self, prior: Option<ErasedValue>, _replayed: Option<&ErasedValue>) {
        let prior = prior.and_then(|v| v.downcast_ref::<u64>().copied());
        DEADLINE_MS.with(|d| d.set(prior));
    }
}

#[test]
fn user_defined_transmittee_propagates() {
    let _guard = REGISTRY_GUARD.lock().unwrap();
    let deadline = Arc::new(Deadline);
    let before = registered_count();
    assert!(register_transmittee(&deadline));
    assert!(!register_transmittee(&deadline), "registration is idempotent");
    assert_eq!(registered_count(), before + 1);

    DEADLINE_MS.with(|d| d.set(Some(250)));
    let snapshot = capture();
    let seen = thread::spawn(move || {
        DEADLINE_MS.with(|d| d.set(Some(5)));
        let during = run_with_captured(&snapshot, || DEADLINE_MS.with(Cell::get));
        (during, DEADLINE_MS.with(Cell::get))
    })
    .join()
    .unwrap();
    assert_eq!(seen, (Some(250), Some(5)));

    assert!(unregister_transmittee(&deadline));
    assert!(!unregister_transmittee(&deadline));
    assert_eq!(registered_count(), before);
}

#[test]
fn dropping_the_last_slot_handle_unregisters_it() {
    let _guard = REGISTRY_GUARD.lock().unwrap();
    let before = registered_count();
    let slot = Slot::<u8>::new();
    let clone = slot.clone();
    assert_eq!(registered_count(), before + 1);
    drop(slot);
    assert_eq!(registered_count(), before + 1);
    drop(clone);
    assert_eq!(registered_count(), before);
}

thread_local! {
    static ZONE: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[test]
fn a_thread_local_is_bridged_at_most_once() {
    let _guard = REGISTRY_GUARD.lock().unwrap();
    let before = registered_count();
    let first = register_thread_local(&ZONE).expect("first registration");
    assert!(register_thread_local(&ZONE).is_none());
    assert!(register_thread_local_with_copier(&ZONE, |z: &String| z.to_uppercase()).is_none());
    assert_eq!(registered_count(), before + 1);

    ZONE.with(|z| *z.borrow_mut() = Some("utc".to_string()));
    let snapshot = capture();
    let seen = thread::spawn(move || {
        run_with_captured(&snapshot, || ZONE.with(|z| z.borrow().clone()))
    })
    .join()
    .unwrap();
    assert_eq!(seen.as_deref(), Some("utc"), "the first bridge's plain clone is used");

    assert!(first.is_registered());
    drop(first);
    assert_eq!(registered_count(), before);
    let again = register_thread_local(&ZONE).expect("free to register again");
    assert_eq!(registered_count(), before + 1);
    drop(again);
}
