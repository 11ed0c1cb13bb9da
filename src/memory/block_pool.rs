//! Fixed-size block pool over an intrusive LIFO free list.
//!
//! The pool carves one backing buffer into `capacity` storage cells at
//! construction and never touches the allocator again. A free cell's first
//! word links to the next free cell; the list head is either a cell address
//! or the one-past-the-end sentinel. Allocation pops the head, release
//! pushes onto it; both are O(1) with no search.
//!
//! `RawBlockPool<MultiThread>` runs the same algorithm with a CAS loop on
//! the head: lock-free allocation, wait-free release fast path. The usual
//! ABA hazard does not apply because the backing buffer is never freed
//! while the pool lives, so a stale head candidate is still a valid cell.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::cell::{self, CellLayout};
use super::stats;
use super::threading::{MultiThread, SingleThread, Threading};

/// Single-threaded block pool.
pub type BlockPool = RawBlockPool<SingleThread>;

/// Lock-free concurrent block pool. Identical contract to [`BlockPool`];
/// does not detect double-release.
pub type ConcurrentBlockPool = RawBlockPool<MultiThread>;

/// Fixed-capacity pool of uniformly sized cells, generic over the
/// synchronization strategy.
pub struct RawBlockPool<C: Threading> {
    base: NonNull<u8>,
    capacity: usize,
    layout: CellLayout,
    buffer: Layout,
    head: C::Head,
    live: C::LiveMask,
}

// Safety: the pool owns its backing buffer; moving the pool moves exclusive
// ownership of the buffer with it.
unsafe impl Send for RawBlockPool<SingleThread> {}
unsafe impl Send for RawBlockPool<MultiThread> {}
// Safety: the concurrent variant mutates only through the atomic head; the
// cells reachable from it are disjoint from cells handed to callers.
unsafe impl Sync for RawBlockPool<MultiThread> {}

impl<C: Threading> RawBlockPool<C> {
    /// Create a pool of `capacity` cells, each able to hold one `payload`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; aborts via `handle_alloc_error` when
    /// the backing buffer cannot be obtained.
    #[must_use]
    pub fn new(payload: Layout, capacity: usize) -> Self {
        Self::with_cells(CellLayout::for_payload(payload), capacity)
    }

    /// Create a pool whose cells are sized for `T`.
    #[must_use]
    pub fn for_type<T>(capacity: usize) -> Self {
        Self::new(Layout::new::<T>(), capacity)
    }

    /// Create a pool from a fully computed cell layout. The chained pool
    /// uses this to add its owner trailer to every cell.
    pub(crate) fn with_cells(layout: CellLayout, capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");

        let buffer = layout.buffer_layout(capacity);
        // Safety: buffer has non-zero size (capacity > 0, stride covers the
        // free-list link).
        let raw = unsafe { std::alloc::alloc(buffer) };
        let Some(base) = NonNull::new(raw) else {
            std::alloc::handle_alloc_error(buffer);
        };

        // Chain every cell onto the free list; the last link is the
        // one-past-the-end sentinel.
        let base_addr = base.as_ptr() as usize;
        debug_assert!(base_addr.is_multiple_of(layout.align()));
        let stride = layout.stride();
        for i in 0..capacity {
            let addr = base_addr + i * stride;
            // Safety: `addr` is a fresh cell inside the buffer.
            unsafe {
                cell::write_next(addr, addr + stride);
            }
        }

        stats::POOL_RESERVED.add(buffer.size());

        Self {
            base,
            capacity,
            layout,
            buffer,
            head: C::head_new(base_addr),
            live: C::mask_new(capacity),
        }
    }

    #[inline]
    fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One-past-the-end address; the empty-list head value.
    #[inline]
    fn sentinel(&self) -> usize {
        self.base_addr() + self.buffer.size()
    }

    /// Whether `ptr` lies inside the backing buffer.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.base_addr() && addr < self.sentinel()
    }

    /// Pop a free cell. Returns `None` when the pool is full.
    ///
    /// The returned address is aligned to the pool's cell alignment and
    /// stays valid until released or until the pool is dropped.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        // Safety: free-list invariant: every address reachable from the
        // head is a free cell of this buffer.
        let addr = unsafe { C::head_pop(&self.head, self.sentinel()) }?;
        C::mask_acquire(&self.live, (addr - self.base_addr()) / self.layout.stride());
        // Safety: `addr` points into a live allocation, so it is non-null.
        Some(unsafe { NonNull::new_unchecked(addr as *mut u8) })
    }

    /// Push a previously allocated cell back onto the free list.
    ///
    /// Returns false, mutating nothing, when `ptr` is outside the backing
    /// buffer or not on a cell boundary. Releasing a pointer that is
    /// currently free is undefined behavior; the single-threaded variant
    /// flags it in debug builds and refuses, the concurrent variant cannot
    /// detect it.
    pub fn release(&self, ptr: NonNull<u8>) -> bool {
        if !self.contains(ptr) {
            return false;
        }

        let offset = ptr.as_ptr() as usize - self.base_addr();
        if !offset.is_multiple_of(self.layout.stride()) {
            debug_assert!(false, "pointer {ptr:p} is not on a cell boundary");
            return false;
        }

        if !C::mask_release(&self.live, offset / self.layout.stride()) {
            return false;
        }

        // Safety: `ptr` is a cell of this buffer and the caller owned it.
        unsafe {
            C::head_push(&self.head, ptr.as_ptr() as usize);
        }
        true
    }

    /// Allocate a cell and construct `value` in it.
    pub fn create<T>(&self, value: T) -> Option<NonNull<T>> {
        debug_assert!(
            self.layout.fits(Layout::new::<T>()),
            "value does not fit this pool's cells",
        );
        let ptr = self.allocate()?;
        // Safety: the cell is live, exclusively ours, and fits `T`.
        Some(unsafe { cell::emplace(ptr, value) })
    }

    /// Drop the `T` at `ptr` in place and release its cell.
    ///
    /// Returns false, without running the destructor, when `ptr` does not
    /// belong to this pool.
    pub fn destroy<T>(&self, ptr: NonNull<T>) -> bool {
        let raw = ptr.cast::<u8>();
        if !self.contains(raw) {
            return false;
        }
        // Safety: `ptr` was produced by `create` on this pool and is live
        // (caller contract).
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
        }
        self.release(raw)
    }

    /// Whether every cell is handed out.
    #[must_use]
    pub fn full(&self) -> bool {
        C::head_load(&self.head) == self.sentinel()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes owned by this pool: the struct plus the backing buffer.
    /// Constant over the pool's life.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        size_of::<Self>() + self.buffer.size()
    }
}

impl<C: Threading> Drop for RawBlockPool<C> {
    fn drop(&mut self) {
        stats::sub_saturating(&stats::POOL_RESERVED, self.buffer.size());
        // Safety: `base` came from `std::alloc::alloc` with this exact
        // layout and is freed exactly once.
        unsafe {
            std::alloc::dealloc(self.base.as_ptr(), self.buffer);
        }
    }
}
