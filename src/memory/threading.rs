//! Synchronization strategy for pools and chains.
//!
//! The single-threaded and concurrent variants are the same algorithms;
//! only the primitives differ. [`Threading`] captures that difference so
//! the pool and chain code exists once: [`SingleThread`] collapses every
//! atomic to a plain cell and every lock to a no-op, [`MultiThread`]
//! supplies the lock-free free-list head, atomic live counters, and the
//! readers-writer spinlock.

use std::cell::RefCell;

use fixedbitset::FixedBitSet;

use super::cell;
use super::rwlock::RwSpinLock;
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use crate::sync::cell::Cell;
use crate::sync::hint;

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::SingleThread {}
    impl Sealed for super::MultiThread {}
}

/// Synchronization strategy selector. Implemented by [`SingleThread`] and
/// [`MultiThread`]; not implementable outside the crate.
pub trait Threading: sealed::Sealed + 'static {
    #[doc(hidden)]
    type Head;
    #[doc(hidden)]
    type Counter;
    #[doc(hidden)]
    type ListLock;
    #[doc(hidden)]
    type LiveMask;

    // ---- free-list head -------------------------------------------------

    #[doc(hidden)]
    fn head_new(addr: usize) -> Self::Head;

    #[doc(hidden)]
    fn head_load(head: &Self::Head) -> usize;

    /// Pop the head cell, or `None` when `head == sentinel`.
    ///
    /// # Safety
    /// Every address reachable from `head` must be a free cell inside a
    /// live backing buffer whose end is `sentinel`.
    #[doc(hidden)]
    unsafe fn head_pop(head: &Self::Head, sentinel: usize) -> Option<usize>;

    /// Push `addr` as the new head.
    ///
    /// # Safety
    /// `addr` must be a cell of the same backing buffer, owned by the
    /// caller (allocated and not yet released).
    #[doc(hidden)]
    unsafe fn head_push(head: &Self::Head, addr: usize);

    // ---- chunk live counter ---------------------------------------------

    #[doc(hidden)]
    fn counter_new() -> Self::Counter;

    #[doc(hidden)]
    fn counter_inc(counter: &Self::Counter);

    /// Decrement; returns the pre-decrement value.
    #[doc(hidden)]
    fn counter_dec(counter: &Self::Counter) -> u32;

    #[doc(hidden)]
    fn counter_load(counter: &Self::Counter) -> u32;

    // ---- chain structure lock -------------------------------------------

    #[doc(hidden)]
    fn lock_new() -> Self::ListLock;
    #[doc(hidden)]
    fn read_lock(lock: &Self::ListLock);
    #[doc(hidden)]
    fn read_unlock(lock: &Self::ListLock);
    #[doc(hidden)]
    fn write_lock(lock: &Self::ListLock);
    #[doc(hidden)]
    fn write_unlock(lock: &Self::ListLock);

    // ---- release-side sanity mask ---------------------------------------

    #[doc(hidden)]
    fn mask_new(capacity: usize) -> Self::LiveMask;

    /// Record that the cell at `index` was handed out.
    #[doc(hidden)]
    fn mask_acquire(mask: &Self::LiveMask, index: usize);

    /// Record that the cell at `index` came back. Returns false when the
    /// cell was not live (double release); the concurrent strategy cannot
    /// track this and always returns true.
    #[doc(hidden)]
    fn mask_release(mask: &Self::LiveMask, index: usize) -> bool;
}

/// Plain loads and stores; for pools owned by one thread.
pub struct SingleThread;

/// Lock-free free lists and a readers-writer spinlock; for shared pools.
pub struct MultiThread;

impl Threading for SingleThread {
    type Head = Cell<usize>;
    type Counter = Cell<u32>;
    type ListLock = ();
    type LiveMask = RefCell<FixedBitSet>;

    #[inline]
    fn head_new(addr: usize) -> Self::Head {
        Cell::new(addr)
    }

    #[inline]
    fn head_load(head: &Self::Head) -> usize {
        head.get()
    }

    #[inline]
    unsafe fn head_pop(head: &Self::Head, sentinel: usize) -> Option<usize> {
        let current = head.get();
        if current == sentinel {
            return None;
        }
        // Safety: `current` is a free cell per the caller's contract.
        head.set(unsafe { cell::read_next(current) });
        Some(current)
    }

    #[inline]
    unsafe fn head_push(head: &Self::Head, addr: usize) {
        // Safety: the caller owns the cell at `addr`.
        unsafe {
            cell::write_next(addr, head.get());
        }
        head.set(addr);
    }

    #[inline]
    fn counter_new() -> Self::Counter {
        Cell::new(0)
    }

    #[inline]
    fn counter_inc(counter: &Self::Counter) {
        counter.set(counter.get() + 1);
    }

    #[inline]
    fn counter_dec(counter: &Self::Counter) -> u32 {
        let previous = counter.get();
        debug_assert!(previous > 0, "live counter underflow");
        counter.set(previous - 1);
        previous
    }

    #[inline]
    fn counter_load(counter: &Self::Counter) -> u32 {
        counter.get()
    }

    #[inline]
    fn lock_new() -> Self::ListLock {}
    #[inline]
    fn read_lock(_lock: &Self::ListLock) {}
    #[inline]
    fn read_unlock(_lock: &Self::ListLock) {}
    #[inline]
    fn write_lock(_lock: &Self::ListLock) {}
    #[inline]
    fn write_unlock(_lock: &Self::ListLock) {}

    fn mask_new(capacity: usize) -> Self::LiveMask {
        RefCell::new(FixedBitSet::with_capacity(capacity))
    }

    #[inline]
    fn mask_acquire(mask: &Self::LiveMask, index: usize) {
        let mut mask = mask.borrow_mut();
        debug_assert!(!mask.contains(index), "handed out a live cell");
        mask.insert(index);
    }

    #[inline]
    fn mask_release(mask: &Self::LiveMask, index: usize) -> bool {
        let mut mask = mask.borrow_mut();
        if !mask.contains(index) {
            debug_assert!(false, "double release of cell {index}");
            return false;
        }
        mask.set(index, false);
        true
    }
}

impl Threading for MultiThread {
    type Head = AtomicUsize;
    type Counter = AtomicU32;
    type ListLock = RwSpinLock;
    type LiveMask = ();

    #[inline]
    fn head_new(addr: usize) -> Self::Head {
        AtomicUsize::new(addr)
    }

    #[inline]
    fn head_load(head: &Self::Head) -> usize {
        head.load(Ordering::Acquire)
    }

    unsafe fn head_pop(head: &Self::Head, sentinel: usize) -> Option<usize> {
        loop {
            let current = head.load(Ordering::Acquire);
            // Re-checked on every retry: another thread may have drained
            // the pool between our load and CAS.
            if current == sentinel {
                return None;
            }
            // Safety: `current` was the head when loaded; if it has since
            // been handed out, this read is stale but the CAS below fails
            // and we never use the value. The cell memory itself stays
            // valid for the pool's whole life.
            let next = unsafe { cell::read_next(current) };
            match head.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Some(current),
                Err(_) => hint::spin_loop(),
            }
        }
    }

    unsafe fn head_push(head: &Self::Head, addr: usize) {
        let mut current = head.load(Ordering::Acquire);
        loop {
            // Safety: the caller owns the cell at `addr`; it is not
            // reachable from the free list until the CAS publishes it.
            unsafe {
                cell::write_next(addr, current);
            }
            match head.compare_exchange_weak(current, addr, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => {
                    current = observed;
                    hint::spin_loop();
                }
            }
        }
    }

    #[inline]
    fn counter_new() -> Self::Counter {
        AtomicU32::new(0)
    }

    #[inline]
    fn counter_inc(counter: &Self::Counter) {
        counter.fetch_add(1, Ordering::Release);
    }

    #[inline]
    fn counter_dec(counter: &Self::Counter) -> u32 {
        let previous = counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "live counter underflow");
        previous
    }

    #[inline]
    fn counter_load(counter: &Self::Counter) -> u32 {
        counter.load(Ordering::Acquire)
    }

    #[inline]
    fn lock_new() -> Self::ListLock {
        RwSpinLock::new()
    }

    #[inline]
    fn read_lock(lock: &Self::ListLock) {
        lock.read_lock();
    }

    #[inline]
    fn read_unlock(lock: &Self::ListLock) {
        lock.read_unlock();
    }

    #[inline]
    fn write_lock(lock: &Self::ListLock) {
        lock.write_lock();
    }

    #[inline]
    fn write_unlock(lock: &Self::ListLock) {
        lock.write_unlock();
    }

    #[inline]
    fn mask_new(_capacity: usize) -> Self::LiveMask {}
    #[inline]
    fn mask_acquire(_mask: &Self::LiveMask, _index: usize) {}
    #[inline]
    fn mask_release(_mask: &Self::LiveMask, _index: usize) -> bool {
        true
    }
}
