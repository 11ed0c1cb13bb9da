//! Chained pool: an ordered list of block-pool chunks that grows on
//! exhaustion and retires empty chunks to a single reserved slot.
//!
//! Every cell carries an owner trailer recording the chunk it came from,
//! so `release` is O(1) with no lookup. The chunk records themselves live
//! in a meta pool (a single-threaded block pool sized for `max_chunks`
//! records) that is only touched under the write lock.
//!
//! Concurrency follows a two-phase protocol: allocation walks the chunk
//! list under the read lock and uses each chunk's lock-free free list;
//! structural changes (appending a chunk, retiring one) take the write
//! lock and re-validate the condition that motivated them, closing the
//! window between dropping the read side and acquiring the write side.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::block_pool::RawBlockPool;
use super::cell::{self, CellLayout};
use super::stats;
use super::threading::{MultiThread, SingleThread, Threading};
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut};

/// Single-threaded chained pool.
pub type PoolChain = RawPoolChain<SingleThread>;

/// Concurrent chained pool. Same contract; any interleaving of `allocate`
/// and `release` from multiple threads behaves like some sequential order.
pub type ConcurrentPoolChain = RawPoolChain<MultiThread>;

/// A block pool plus its live-allocation count; the unit of growth and
/// retirement.
struct Chunk<C: Threading> {
    pool: RawBlockPool<C>,
    live: C::Counter,
}

impl<C: Threading> Chunk<C> {
    fn new(cells: CellLayout, capacity: usize) -> Self {
        Self {
            pool: RawBlockPool::with_cells(cells, capacity),
            live: C::counter_new(),
        }
    }

    fn used_memory(&self) -> usize {
        size_of::<Self>() + self.pool.used_memory()
    }
}

/// Growable pool of fixed-size blocks, generic over the synchronization
/// strategy.
pub struct RawPoolChain<C: Threading> {
    cells: CellLayout,
    chunk_capacity: usize,
    /// Footprint of one chunk (record + backing), measured once from the
    /// initial chunk.
    chunk_footprint: usize,
    /// Chunk records; mutated only under the write lock.
    meta: RawBlockPool<SingleThread>,
    /// Live chunks in insertion order; read under the read lock, mutated
    /// under the write lock.
    active: UnsafeCell<Vec<NonNull<Chunk<C>>>>,
    /// At most one retired, empty chunk kept hot for reuse.
    reserved: UnsafeCell<Option<NonNull<Chunk<C>>>>,
    lock: C::ListLock,
}

// Safety: the chain owns its chunks and meta pool; moving it moves
// exclusive ownership.
unsafe impl Send for RawPoolChain<SingleThread> {}
unsafe impl Send for RawPoolChain<MultiThread> {}
// Safety: `active`, `reserved`, and the meta pool are only mutated under
// the write lock and only read under the read lock; per-chunk free lists
// synchronize themselves.
unsafe impl Sync for RawPoolChain<MultiThread> {}

impl<C: Threading> RawPoolChain<C> {
    /// Create a chain of pools of `chunk_capacity` cells each, holding one
    /// `payload` per cell, growing up to `max_chunks` simultaneous chunks.
    /// One chunk is built immediately.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_capacity` or `max_chunks` is zero.
    #[must_use]
    pub fn new(payload: Layout, chunk_capacity: usize, max_chunks: usize) -> Self {
        assert!(chunk_capacity > 0, "chunk capacity must be non-zero");
        assert!(max_chunks > 0, "chunk limit must be non-zero");

        let cells = CellLayout::with_owner_trailer(payload);
        let meta = RawBlockPool::for_type::<Chunk<C>>(max_chunks);

        let first = meta
            .create(Chunk::new(cells, chunk_capacity))
            .unwrap_or_else(|| unreachable!("meta pool holds at least one record"));
        stats::CHAIN_CHUNKS_LIVE.add(1);
        // Safety: freshly created, exclusively ours.
        let chunk_footprint = unsafe { first.as_ref() }.used_memory();

        let mut active = Vec::with_capacity(max_chunks);
        active.push(first);

        Self {
            cells,
            chunk_capacity,
            chunk_footprint,
            meta,
            active: UnsafeCell::new(active),
            reserved: UnsafeCell::new(None),
            lock: C::lock_new(),
        }
    }

    /// Create a chain whose cells are sized for `T`.
    #[must_use]
    pub fn for_type<T>(chunk_capacity: usize, max_chunks: usize) -> Self {
        Self::new(Layout::new::<T>(), chunk_capacity, max_chunks)
    }

    /// Allocate a block from the first chunk with free capacity, growing
    /// the chain when all chunks are full. `None` when `max_chunks` chunks
    /// exist and none has room.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        loop {
            C::read_lock(&self.lock);
            // Safety: shared access is valid under the read lock.
            let active = unsafe_cell_get!(self.active);
            for &chunk_ptr in active.iter() {
                // Safety: listed chunks stay alive; only a displaced
                // reserve is ever destroyed.
                let chunk = unsafe { chunk_ptr.as_ref() };
                if let Some(ptr) = chunk.pool.allocate() {
                    // Safety: the cell is exclusively ours and carries an
                    // owner trailer by construction.
                    unsafe {
                        cell::write_owner(ptr, self.cells.trailer_offset(), chunk_ptr.as_ptr().cast());
                    }
                    // Incremented before the read lock drops so a racing
                    // retire cannot observe a stale zero.
                    C::counter_inc(&chunk.live);
                    C::read_unlock(&self.lock);
                    return Some(ptr);
                }
            }
            let snapshot = active.len();
            C::read_unlock(&self.lock);

            C::write_lock(&self.lock);
            // Safety: exclusive access is valid under the write lock.
            let active = unsafe_cell_get_mut!(self.active);
            if active.len() != snapshot {
                // Another thread grew or shrank the chain; the fast path
                // may succeed now.
                C::write_unlock(&self.lock);
                continue;
            }

            let reserved = unsafe_cell_get_mut!(self.reserved);
            let next = if let Some(chunk) = reserved.take() {
                Some(chunk)
            } else if self.meta.full() {
                None
            } else {
                let created = self.meta.create(Chunk::new(self.cells, self.chunk_capacity));
                if created.is_some() {
                    stats::CHAIN_CHUNKS_LIVE.add(1);
                }
                created
            };

            match next {
                Some(chunk) => {
                    active.push(chunk);
                    C::write_unlock(&self.lock);
                    // Restart on the fast path; under contention the new
                    // chunk may serve other threads first.
                }
                None => {
                    C::write_unlock(&self.lock);
                    return None;
                }
            }
        }
    }

    /// Return a block to its owning chunk, retiring the chunk when its
    /// last live block goes away.
    ///
    /// Returns false, mutating nothing, when `ptr` does not lie in the
    /// owning chunk's buffer. `ptr` must come from this chain's `allocate`
    /// (the owner trailer is trusted).
    pub fn release(&self, ptr: NonNull<u8>) -> bool {
        let chunk_ptr = self.owner_of(ptr);
        // Safety: a chunk with live allocations is never destroyed.
        let chunk = unsafe { chunk_ptr.as_ref() };
        if !chunk.pool.release(ptr) {
            return false;
        }
        if C::counter_dec(&chunk.live) == 1 {
            self.retire(chunk_ptr);
        }
        true
    }

    /// Allocate a block and construct `value` in it.
    pub fn create<T>(&self, value: T) -> Option<NonNull<T>> {
        debug_assert!(
            self.cells.fits(Layout::new::<T>()),
            "value does not fit this chain's cells",
        );
        let ptr = self.allocate()?;
        // Safety: the cell is live, exclusively ours, and fits `T`.
        Some(unsafe { cell::emplace(ptr, value) })
    }

    /// Drop the `T` at `ptr` in place and release its block.
    ///
    /// Returns false, without running the destructor, when `ptr` does not
    /// lie in the owning chunk's buffer.
    pub fn destroy<T>(&self, ptr: NonNull<T>) -> bool {
        let raw = ptr.cast::<u8>();
        let chunk_ptr = self.owner_of(raw);
        // Safety: as in `release`.
        let chunk = unsafe { chunk_ptr.as_ref() };
        if !chunk.pool.contains(raw) {
            return false;
        }
        // Safety: live payload created by this chain (caller contract).
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
        }
        if !chunk.pool.release(raw) {
            return false;
        }
        if C::counter_dec(&chunk.live) == 1 {
            self.retire(chunk_ptr);
        }
        true
    }

    /// Bytes owned by the chain: the struct, the meta pool, one footprint
    /// per active or reserved chunk, and the chunk list's storage.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        C::read_lock(&self.lock);
        // Safety: shared access under the read lock.
        let active = unsafe_cell_get!(self.active);
        let reserved = unsafe_cell_get!(self.reserved);
        let chunks = active.len() + usize::from(reserved.is_some());
        let list_bytes = active.capacity() * size_of::<NonNull<Chunk<C>>>();
        let total =
            size_of::<Self>() + self.meta.used_memory() + chunks * self.chunk_footprint + list_bytes;
        C::read_unlock(&self.lock);
        total
    }

    /// Number of chunks currently in the active list.
    #[must_use]
    pub fn active_chunks(&self) -> usize {
        C::read_lock(&self.lock);
        // Safety: shared access under the read lock.
        let len = unsafe_cell_get!(self.active).len();
        C::read_unlock(&self.lock);
        len
    }

    /// Whether a retired chunk is parked for reuse.
    #[must_use]
    pub fn has_reserved(&self) -> bool {
        C::read_lock(&self.lock);
        // Safety: shared access under the read lock.
        let some = unsafe_cell_get!(self.reserved).is_some();
        C::read_unlock(&self.lock);
        some
    }

    #[must_use]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Recover the owning chunk from a block's trailer.
    fn owner_of(&self, ptr: NonNull<u8>) -> NonNull<Chunk<C>> {
        // Safety: caller contract: `ptr` came from this chain's
        // `allocate`, which stamped the trailer.
        let owner = unsafe { cell::read_owner(ptr, self.cells.trailer_offset()) };
        debug_assert!(!owner.is_null(), "block carries no owner trailer");
        // Safety: stamped trailers hold the non-null chunk address.
        unsafe { NonNull::new_unchecked(owner.cast::<Chunk<C>>()) }
    }

    /// Move an empty chunk out of the active list into the reserved slot,
    /// destroying whichever chunk the slot held before.
    fn retire(&self, chunk_ptr: NonNull<Chunk<C>>) {
        C::write_lock(&self.lock);
        // Safety: exclusive access under the write lock.
        let active = unsafe_cell_get_mut!(self.active);
        let reserved = unsafe_cell_get_mut!(self.reserved);
        // The chunk may have been retired by a racing releaser, displaced
        // by a third retirement, and destroyed before this lock was
        // granted; it must not be touched unless the chain still knows it.
        let known = *reserved == Some(chunk_ptr) || active.contains(&chunk_ptr);
        // Re-check the count: an allocation may have revived the chunk
        // between the zero-reaching decrement and this lock.
        // Safety: a known chunk is alive.
        if known && C::counter_load(unsafe { &chunk_ptr.as_ref().live }) == 0 {
            if let Some(displaced) = *reserved
                && displaced != chunk_ptr
            {
                self.destroy_chunk(displaced);
            }
            active.retain(|&c| c != chunk_ptr);
            *reserved = Some(chunk_ptr);
        }
        C::write_unlock(&self.lock);
    }

    /// Drop a chunk record back into the meta pool. Write lock (or
    /// exclusive access) required.
    fn destroy_chunk(&self, chunk: NonNull<Chunk<C>>) {
        stats::sub_saturating(&stats::CHAIN_CHUNKS_LIVE, 1);
        let destroyed = self.meta.destroy(chunk);
        debug_assert!(destroyed, "chunk record outside the meta pool");
    }
}

impl<C: Threading> Drop for RawPoolChain<C> {
    fn drop(&mut self) {
        // Exclusive access: no locking needed.
        let active = unsafe_cell_get_mut!(self.active);
        for chunk in active.drain(..) {
            self.destroy_chunk(chunk);
        }
        let reserved = unsafe_cell_get_mut!(self.reserved);
        if let Some(chunk) = reserved.take() {
            self.destroy_chunk(chunk);
        }
    }
}
