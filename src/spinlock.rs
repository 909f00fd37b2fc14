// SPDX-License-Identifier: MIT OR Apache-2.0
/*!
Short critical sections on process-wide state.

The slot registry is read on every capture and replay but written only when a
slot comes or goes, and every read is a handful of pointer copies.  A spinning
reader/writer lock keeps those reads cheap without parking threads.

The lock has no writer preference: a writer waits until the reader count drops to
zero, so a steady stream of overlapping readers can hold it off.  Readers only copy
an `Arc` before leaving, and writes happen once per registration, so in practice
the count reaches zero between reads.

[`SnapshotCell`] builds on that: readers leave the lock holding an `Arc` to an
immutable value, so whatever they do with it afterwards never blocks a writer,
and a writer never mutates a value someone is still looking at.
*/

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

const UNLOCKED: u8 = 0;
//up to 254 concurrent readers, or one writer
const WRITER: u8 = u8::MAX;

pub(crate) struct Spinlock<T> {
    state: AtomicU8,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `state`; shared access only hands out `&T`
// to readers while no writer holds the lock.
unsafe impl<T: Send> Send for Spinlock<T> {}
// SAFETY: see above. Readers on different threads may observe `&T` concurrently, so `T: Sync`.
unsafe impl<T: Send + Sync> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub(crate) const fn new(data: T) -> Self {
        Spinlock {
            state: AtomicU8::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    fn acquire_read(&self) {
        while self
            .state
            .fetch_update(Acquire, Relaxed, |v| (v < WRITER - 1).then_some(v + 1))
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn acquire_write(&self) {
        while self
            .state
            .compare_exchange_weak(UNLOCKED, WRITER, Acquire, Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Runs `f` with shared access.  `f` must not re-enter this lock for writing.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.acquire_read();
        let _held = Held::Read(&self.state);
        // SAFETY: the reader count is non-zero, so no writer can hold the lock.
        f(unsafe { &*self.data.get() })
    }

    /// Runs `f` with exclusive access.  `f` must not re-enter this lock.
    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.acquire_write();
        let _held = Held::Write(&self.state);
        // SAFETY: we hold the writer state, so nobody else can observe `data`.
        f(unsafe { &mut *self.data.get() })
    }
}

/// Releases the lock even if the closure running under it panics.
enum Held<'a> {
    Read(&'a AtomicU8),
    Write(&'a AtomicU8),
}

impl Drop for Held<'_> {
    fn drop(&mut self) {
        match self {
            Held::Read(state) => {
                state.fetch_sub(1, Release);
            }
            Held::Write(state) => state.store(UNLOCKED, Release),
        }
    }
}

/// A copy-on-write cell: `load` is a single consistent read, `update` publishes a whole new value.
pub(crate) struct SnapshotCell<T> {
    current: Spinlock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub(crate) fn new(value: T) -> Self {
        SnapshotCell {
            current: Spinlock::new(Arc::new(value)),
        }
    }

    /// Returns the value as of this instant.  Later updates never affect the returned `Arc`.
    pub(crate) fn load(&self) -> Arc<T> {
        self.current.read(Arc::clone)
    }

    /// Builds a replacement from the current value and publishes it atomically.
    ///
    /// `f` runs under the write lock; it must be short and must not touch this cell.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&T) -> (T, R)) -> R {
        let (retired, result) = self.current.write(|current| {
            let (next, result) = f(current);
            (std::mem::replace(current, Arc::new(next)), result)
        });
        // the old value may hold the last reference to something with a Drop impl; let it go
        // outside the lock
        drop(retired);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn load_is_unaffected_by_later_update() {
        let cell = SnapshotCell::new(vec![1, 2, 3]);
        let before = cell.load();
        cell.update(|v| {
            let mut next = v.clone();
            next.push(4);
            (next, ())
        });
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*cell.load(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn lock_is_released_after_panic() {
        let lock = Arc::new(Spinlock::new(0));
        let lock2 = Arc::clone(&lock);
        let result = thread::spawn(move || {
            lock2.write(|_| panic!("boom"));
        })
        .join();
        assert!(result.is_err());
        assert_eq!(
            lock.write(|v| {
                *v += 1;
                *v
            }),
            1
        );
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let cell = Arc::new(SnapshotCell::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    for _ in 0..500 {
                        cell.update(|v| (v + 1, ()));
                        let _ = cell.load();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker should not panic");
        }
        assert_eq!(*cell.load(), 8 * 500);
    }

    #[test]
    fn writer_gets_through_busy_readers() {
        let cell = Arc::new(SnapshotCell::new(0u32));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Relaxed) {
                        let _ = cell.load();
                    }
                })
            })
            .collect();
        for i in 1..=100 {
            cell.update(|_| (i, ()));
        }
        stop.store(true, Relaxed);
        for reader in readers {
            reader.join().expect("reader should not panic");
        }
        assert_eq!(*cell.load(), 100);
    }
}
