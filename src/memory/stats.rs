//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., a pool's backing bytes may briefly disagree with
//! the chunk count that owns them). This is acceptable for diagnostic
//! display. Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Backing bytes owned by live block pools (chained-pool chunks included).
crate::sync::static_atomic! {
    pub static POOL_RESERVED: Counter = Counter::new();
}
// Chunks currently alive across all chained pools (active + reserved).
crate::sync::static_atomic! {
    pub static CHAIN_CHUNKS_LIVE: Counter = Counter::new();
}
// Buffer bytes owned by the owning stack allocators.
crate::sync::static_atomic! {
    pub static STACK_RESERVED: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time snapshot of the diagnostic gauges.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub pool_reserved: usize,
    pub chain_chunks_live: usize,
    pub stack_reserved: usize,
}

/// Snapshot every gauge. Values are mutually unsynchronized; see the module
/// notes.
#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        pool_reserved: POOL_RESERVED.load(Ordering::Relaxed),
        chain_chunks_live: CHAIN_CHUNKS_LIVE.load(Ordering::Relaxed),
        stack_reserved: STACK_RESERVED.load(Ordering::Relaxed),
    }
}
