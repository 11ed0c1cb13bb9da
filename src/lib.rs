pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocators
pub use memory::block_pool::{BlockPool, ConcurrentBlockPool, RawBlockPool};
pub use memory::chain::{ConcurrentPoolChain, PoolChain, RawPoolChain};
pub use memory::stack::{
    DualStackAllocator, Marker, StackAllocator, StackRegion, StackScope,
};
pub use memory::threading::{MultiThread, SingleThread, Threading};

// stats
pub use memory::stats::{MemoryStats, memory_stats};
