//! Epoch-protected replaceable cell.
//!
//! The per-processor domain chains are read on every tick by the balancer
//! and replaced only by rare topology rebuilds. [`EpochCell`] gives readers
//! a wait-free borrow of the current value and lets the single writer free
//! the previous value once every reader that could have seen it has left.
//!
//! # Protocol
//!
//! The cell keeps an epoch counter and two reader tallies, indexed by epoch
//! parity. A reader increments the tally for the epoch's parity, re-checks
//! the epoch, and retries on mismatch; the re-check guarantees that a
//! registered reader holds either the current pointer or the one the
//! in-flight writer just unpublished, never anything older. A writer
//! (serialized by a mutex) swaps the pointer, advances the epoch, then
//! spins until the old parity's tally drains before freeing. Because the
//! writer lock is held across the drain, no value can be freed while a
//! reader that might hold it is still registered.

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A single-slot, read-mostly cell with epoch-based reclamation.
pub(crate) struct EpochCell<T> {
    ptr: AtomicPtr<T>,
    epoch: AtomicU64,
    active: [AtomicUsize; 2],
    writer: Mutex<()>,
}

impl<T> EpochCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            epoch: AtomicU64::new(0),
            active: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: Mutex::new(()),
        }
    }

    /// Runs `f` against the current value.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        loop {
            let epoch = self.epoch.load(Ordering::Acquire);
            let parity = (epoch & 1) as usize;
            self.active[parity].fetch_add(1, Ordering::AcqRel);
            if self.epoch.load(Ordering::Acquire) == epoch {
                let ptr = self.ptr.load(Ordering::Acquire);
                // SAFETY: the pointer was published by `new` or `replace`
                // and cannot be freed while this parity's tally is nonzero;
                // the writer drains the tally before dropping.
                let result = f(unsafe { &*ptr });
                self.active[parity].fetch_sub(1, Ordering::Release);
                return result;
            }
            // A writer advanced the epoch between the two loads; back out
            // and re-register under the new parity.
            self.active[parity].fetch_sub(1, Ordering::Release);
        }
    }

    /// Publishes a new value and frees the previous one once no reader can
    /// still hold it. Blocks concurrent writers.
    pub(crate) fn replace(&self, value: T) {
        let _writer = self.writer.lock();
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, Ordering::AcqRel);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel);
        let old_parity = (epoch & 1) as usize;
        while self.active[old_parity].load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        // SAFETY: `old` came from `Box::into_raw`, is no longer published,
        // and every reader registered under the old parity has left.
        drop(unsafe { Box::from_raw(old) });
    }
}

impl<T> Drop for EpochCell<T> {
    fn drop(&mut self) {
        let ptr = self.ptr.load(Ordering::Acquire);
        // SAFETY: exclusive access; the pointer is always valid.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for EpochCell<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.read(|value| f.debug_tuple("EpochCell").field(value).finish())
    }
}

// SAFETY: the cell hands out only shared borrows scoped to `read`, and
// reclamation is serialized behind the writer lock.
unsafe impl<T: Send + Sync> Send for EpochCell<T> {}
unsafe impl<T: Send + Sync> Sync for EpochCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn read_sees_current_value() {
        let cell = EpochCell::new(1u32);
        assert_eq!(cell.read(|v| *v), 1);
        cell.replace(2);
        assert_eq!(cell.read(|v| *v), 2);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let cell = Arc::new(EpochCell::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut last = 0;
                    while !stop.load(Ordering::Relaxed) {
                        let seen = cell.read(|v| *v);
                        assert!(seen >= last, "values must never run backwards");
                        last = seen;
                    }
                })
            })
            .collect();
        for i in 1..=1000 {
            cell.replace(i);
        }
        stop.store(true, Ordering::Relaxed);
        for handle in readers {
            handle.join().expect("reader panicked");
        }
        assert_eq!(cell.read(|v| *v), 1000);
    }
}
