//! Single-word readers-writer spinlock.
//!
//! State encoding: 0 = idle, n > 0 = n readers, -1 = writer held.
//! Readers CAS `n >= 0` to `n + 1`; a writer CASes 0 to -1. There is no
//! reader-to-writer upgrade: the chained pool always drops its read side
//! before attempting the write side and re-validates afterward.

use crate::sync::atomic::{AtomicIsize, Ordering};
use crate::sync::hint;

const WRITER: isize = -1;

pub struct RwSpinLock {
    state: AtomicIsize,
}

impl RwSpinLock {
    #[cfg(not(loom))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicIsize::new(0),
        }
    }

    #[cfg(loom)]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicIsize::new(0),
        }
    }

    /// Acquire the lock in shared mode. Spins while a writer holds it.
    pub(crate) fn read_lock(&self) {
        let mut v = self.state.load(Ordering::Acquire);
        loop {
            if v < 0 {
                hint::spin_loop();
                v = self.state.load(Ordering::Acquire);
                continue;
            }
            match self
                .state
                .compare_exchange_weak(v, v + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => v = current,
            }
        }
    }

    /// Release a shared hold.
    pub(crate) fn read_unlock(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "read_unlock without a read hold");
    }

    /// Acquire the lock exclusively. Spins while readers or a writer hold it.
    pub(crate) fn write_lock(&self) {
        loop {
            match self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(_) => hint::spin_loop(),
            }
        }
    }

    /// Release the exclusive hold.
    pub(crate) fn write_unlock(&self) {
        debug_assert!(self.state.load(Ordering::Relaxed) == WRITER);
        self.state.store(0, Ordering::Release);
    }
}
