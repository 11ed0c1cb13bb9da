//! Stack regions: LIFO-scoped bump allocation with explicit markers.
//!
//! A region is a byte buffer and a single `head` offset. `allocate` bumps
//! the head (down for the top-down variant, up for the bottom-up one);
//! `free` rewinds it to a previously recorded marker. Nothing is tracked
//! per allocation, so rewinding is the only way to reclaim space.
//!
//! [`StackAllocator`] owns a buffer plus a top-down region.
//! [`DualStackAllocator`] partitions one buffer into a bottom-up half and
//! a top-down half; the halves meet at the midpoint but each bounds its
//! own head, so neither can reach into the other. [`StackScope`] records
//! the head on construction and rewinds on drop.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::cell::align_up;
use super::stats;

/// A saved `head` offset, used to rewind a region.
pub type Marker = usize;

/// Bump region over a borrowed byte buffer.
///
/// `TOP_DOWN` selects the growth direction: `true` starts at the buffer
/// end and bumps downward, `false` starts at offset 0 and bumps upward.
pub struct StackRegion<'buf, const TOP_DOWN: bool = true> {
    base: NonNull<u8>,
    len: usize,
    head: usize,
    _buffer: PhantomData<&'buf mut [u8]>,
}

// Safety: the region holds the only view of its buffer bytes.
unsafe impl<const TOP_DOWN: bool> Send for StackRegion<'_, TOP_DOWN> {}

impl<'buf, const TOP_DOWN: bool> StackRegion<'buf, TOP_DOWN> {
    /// Create a region over `buffer`. The head starts at the empty
    /// position for the chosen direction.
    pub fn new(buffer: &'buf mut [u8]) -> Self {
        let len = buffer.len();
        // Safety: a slice pointer is never null.
        let base = unsafe { NonNull::new_unchecked(buffer.as_mut_ptr()) };
        // Safety: the borrow of `buffer` is held by `'buf`.
        unsafe { Self::from_raw(base, len) }
    }

    /// Build a region from raw parts.
    ///
    /// # Safety
    /// `base..base + len` must be writable for `'buf` and not accessed
    /// through any other path while the region hands out addresses.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            head: if TOP_DOWN { len } else { 0 },
            _buffer: PhantomData,
        }
    }

    #[inline]
    fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // Safety: `offset` stays within the buffer (or one past its end,
        // which is still a valid address of the same allocation).
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Bump out `bytes` bytes. `None` when the region has too little room.
    pub fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if TOP_DOWN {
            if self.head < bytes {
                return None;
            }
            self.head -= bytes;
            Some(self.at(self.head))
        } else {
            let start = self.head;
            let end = start.checked_add(bytes)?;
            if end > self.len {
                return None;
            }
            self.head = end;
            Some(self.at(start))
        }
    }

    /// Bump out `bytes` bytes at an address aligned to `align` (a power of
    /// two). Overallocates by `align - 1` and aligns the result upward.
    pub fn allocate_aligned(&mut self, bytes: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let padded = bytes.checked_add(align - 1)?;
        let ptr = self.allocate(padded)?;
        let aligned = align_up(ptr.as_ptr() as usize, align);
        // Safety: `aligned` stays within the just-reserved range.
        Some(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Rewind the head to `marker`, reclaiming everything allocated since
    /// it was recorded.
    pub fn free(&mut self, marker: Marker) {
        debug_assert!(marker <= self.len, "marker outside the region");
        if TOP_DOWN {
            debug_assert!(marker >= self.head, "marker does not rewind");
        } else {
            debug_assert!(marker <= self.head, "marker does not rewind");
        }
        self.head = marker;
    }

    /// The current head as a marker.
    #[must_use]
    pub fn head(&self) -> Marker {
        self.head
    }

    /// Reclaim the whole region.
    pub fn clear(&mut self) {
        self.head = if TOP_DOWN { self.len } else { 0 };
    }

    /// Bytes still available.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        if TOP_DOWN { self.head } else { self.len - self.head }
    }

    /// Allocate room for a `T` (naturally aligned) and construct `value`
    /// in it.
    pub fn create<T>(&mut self, value: T) -> Option<NonNull<T>> {
        self.create_aligned(align_of::<T>(), value)
    }

    /// Like [`create`](Self::create) with an explicit (stricter) alignment.
    pub fn create_aligned<T>(&mut self, align: usize, value: T) -> Option<NonNull<T>> {
        let align = align.max(align_of::<T>());
        let ptr = self.allocate_aligned(size_of::<T>(), align)?;
        let typed = ptr.cast::<T>();
        // Safety: the range is reserved, aligned, and exclusively ours.
        unsafe {
            typed.as_ptr().write(value);
        }
        Some(typed)
    }

    /// Run the destructor of a value created in this region. The space is
    /// reclaimed only by a later `free`/`clear`.
    pub fn destroy<T>(&self, ptr: NonNull<T>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        debug_assert!(
            addr >= base && addr + size_of::<T>() <= base + self.len,
            "pointer {ptr:p} is not from this region",
        );
        // Safety: `ptr` was produced by `create*` on this region and is
        // live (caller contract).
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
        }
    }
}

/// RAII rewind guard: records the head at construction and frees back to
/// it on drop. Derefs to the region, so allocations made through the scope
/// are reclaimed with it.
pub struct StackScope<'s, 'buf, const TOP_DOWN: bool> {
    region: &'s mut StackRegion<'buf, TOP_DOWN>,
    marker: Marker,
}

impl<'s, 'buf, const TOP_DOWN: bool> StackScope<'s, 'buf, TOP_DOWN> {
    pub fn new(region: &'s mut StackRegion<'buf, TOP_DOWN>) -> Self {
        let marker = region.head();
        Self { region, marker }
    }
}

impl<const TOP_DOWN: bool> Drop for StackScope<'_, '_, TOP_DOWN> {
    fn drop(&mut self) {
        self.region.free(self.marker);
    }
}

impl<'buf, const TOP_DOWN: bool> std::ops::Deref for StackScope<'_, 'buf, TOP_DOWN> {
    type Target = StackRegion<'buf, TOP_DOWN>;

    fn deref(&self) -> &Self::Target {
        &*self.region
    }
}

impl<const TOP_DOWN: bool> std::ops::DerefMut for StackScope<'_, '_, TOP_DOWN> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.region
    }
}

// Base alignment of owned heap buffers.
const BUFFER_ALIGN: usize = 16;

fn alloc_buffer(capacity: usize) -> (NonNull<u8>, Layout) {
    assert!(capacity > 0, "stack capacity must be non-zero");
    let layout = Layout::from_size_align(capacity, BUFFER_ALIGN).expect("stack buffer layout");
    // Safety: layout has non-zero size.
    let raw = unsafe { std::alloc::alloc(layout) };
    let Some(base) = NonNull::new(raw) else {
        std::alloc::handle_alloc_error(layout);
    };
    stats::STACK_RESERVED.add(capacity);
    (base, layout)
}

/// Owning top-down stack: a heap buffer plus its region.
pub struct StackAllocator {
    region: StackRegion<'static, true>,
    base: NonNull<u8>,
    layout: Layout,
}

// Safety: the allocator owns its buffer.
unsafe impl Send for StackAllocator {}

impl StackAllocator {
    /// # Panics
    ///
    /// Panics if `capacity` is zero; aborts via `handle_alloc_error` when
    /// the buffer cannot be obtained.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (base, layout) = alloc_buffer(capacity);
        Self {
            // Safety: the buffer outlives the region; both die in Drop.
            region: unsafe { StackRegion::from_raw(base, capacity) },
            base,
            layout,
        }
    }

    pub fn stack(&mut self) -> &mut StackRegion<'static, true> {
        &mut self.region
    }
}

impl std::ops::Deref for StackAllocator {
    type Target = StackRegion<'static, true>;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

impl std::ops::DerefMut for StackAllocator {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.region
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        stats::sub_saturating(&stats::STACK_RESERVED, self.layout.size());
        // Safety: `base` came from `alloc_buffer` with this layout.
        unsafe {
            std::alloc::dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

/// Owning dual stack: one buffer partitioned into a bottom-up half over
/// `[0, capacity / 2)` and a top-down half over `[capacity / 2, capacity)`.
/// The halves meet at the midpoint but each is confined to its own range.
pub struct DualStackAllocator {
    top: StackRegion<'static, true>,
    bottom: StackRegion<'static, false>,
    base: NonNull<u8>,
    layout: Layout,
}

// Safety: the allocator owns its buffer.
unsafe impl Send for DualStackAllocator {}

impl DualStackAllocator {
    /// # Panics
    ///
    /// Panics if `capacity` is zero; aborts via `handle_alloc_error` when
    /// the buffer cannot be obtained.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (base, layout) = alloc_buffer(capacity);
        let half = capacity / 2;
        // Safety: `half` is inside the buffer.
        let upper = unsafe { NonNull::new_unchecked(base.as_ptr().add(half)) };
        Self {
            // Safety: the two halves are disjoint views of one owned
            // buffer.
            top: unsafe { StackRegion::from_raw(upper, capacity - half) },
            bottom: unsafe { StackRegion::from_raw(base, half) },
            base,
            layout,
        }
    }

    /// The half that grows downward from the buffer end.
    pub fn top(&mut self) -> &mut StackRegion<'static, true> {
        &mut self.top
    }

    /// The half that grows upward from offset 0.
    pub fn bottom(&mut self) -> &mut StackRegion<'static, false> {
        &mut self.bottom
    }
}

impl Drop for DualStackAllocator {
    fn drop(&mut self) {
        stats::sub_saturating(&stats::STACK_RESERVED, self.layout.size());
        // Safety: `base` came from `alloc_buffer` with this layout.
        unsafe {
            std::alloc::dealloc(self.base.as_ptr(), self.layout);
        }
    }
}
