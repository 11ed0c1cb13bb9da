// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from the `loom` crate.  Otherwise,
// re-exports from `std`.
//
// **Every** file in the crate must import sync primitives through this
// module.  A single direct `use std::sync::atomic::*` would bypass loom's
// scheduler and silently break exhaustive testing.
#![allow(unused_imports, unused_macros)]

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize, Ordering};
}

// ---------------------------------------------------------------------------
// sync (Arc, RwLock)
// ---------------------------------------------------------------------------
#[cfg(loom)]
pub(crate) use loom::sync::{Arc, RwLock};

#[cfg(not(loom))]
pub(crate) use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// cell (UnsafeCell, Cell)
//
// loom's UnsafeCell differs from std: `.get()` returns a `ConstPtr<T>`
// wrapper instead of `*mut T`.  To write code that compiles under both, use
// the `unsafe_cell_get!` and `unsafe_cell_get_mut!` helper macros.
// ---------------------------------------------------------------------------
pub(crate) mod cell {
    #[cfg(loom)]
    pub(crate) use loom::cell::{Cell, UnsafeCell};

    #[cfg(not(loom))]
    pub(crate) use std::cell::{Cell, UnsafeCell};
}

/// Access the contents of an `UnsafeCell` as `&T`.
///
/// Under std: `&*cell.get()`
/// Under loom: `cell.with(|p| &*p)`
///
/// # Safety
/// Caller must guarantee no concurrent mutable access (same as
/// `UnsafeCell::get`).
macro_rules! unsafe_cell_get {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &*$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with(|p| &*p) }
        }
    }};
}
pub(crate) use unsafe_cell_get;

/// Access the contents of an `UnsafeCell` as `&mut T`.
///
/// Under std: `&mut *cell.get()`
/// Under loom: `cell.with_mut(|p| &mut *p)`
///
/// # Safety
/// Caller must guarantee exclusive access (same as `UnsafeCell::get`).
macro_rules! unsafe_cell_get_mut {
    ($cell:expr) => {{
        #[cfg(not(loom))]
        {
            // Safety: upheld by caller.
            unsafe { &mut *$cell.get() }
        }
        #[cfg(loom)]
        {
            // Safety: upheld by caller.
            unsafe { $cell.with_mut(|p| &mut *p) }
        }
    }};
}
pub(crate) use unsafe_cell_get_mut;

// ---------------------------------------------------------------------------
// hint
// ---------------------------------------------------------------------------
pub(crate) mod hint {
    #[cfg(loom)]
    pub(crate) use loom::hint::spin_loop;

    #[cfg(not(loom))]
    pub(crate) use std::hint::spin_loop;
}

// ---------------------------------------------------------------------------
// thread
// ---------------------------------------------------------------------------
pub(crate) mod thread {
    #[cfg(loom)]
    pub(crate) use loom::thread::{JoinHandle, current, spawn, yield_now};

    #[cfg(not(loom))]
    pub(crate) use std::thread::{JoinHandle, current, spawn, yield_now};
}

// ---------------------------------------------------------------------------
// Barrier — loom does not provide Barrier; we shim an atomic countdown.
// Standard tests keep std::sync::Barrier.
// ---------------------------------------------------------------------------
pub(crate) mod barrier {
    #[cfg(not(loom))]
    pub(crate) use std::sync::Barrier;

    /// Under loom, Barrier is not available.  A minimal spin-barrier built
    /// on loom atomics keeps existing tests compiling unmodified.
    #[cfg(loom)]
    #[allow(dead_code)]
    pub(crate) struct Barrier {
        total: usize,
        count: super::atomic::AtomicUsize,
    }

    #[cfg(loom)]
    #[allow(dead_code)]
    impl Barrier {
        pub(crate) fn new(n: usize) -> Self {
            Self {
                total: n,
                count: super::atomic::AtomicUsize::new(0),
            }
        }

        pub(crate) fn wait(&self) {
            use super::atomic::Ordering;
            let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
            if arrived < self.total {
                while self.count.load(Ordering::Acquire) < self.total {
                    loom::thread::yield_now();
                }
            }
            // All threads have arrived.
        }
    }
}

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics/RwLock are not const-constructible.  These macros create
// statics that work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic.  Under std, uses `const` init.  Under loom,
/// uses `loom::lazy_static!` so the value is re-created for each model run.
///
/// Usage: `static_atomic! { [pub] static NAME: Type = init_expr; }`
#[allow(unused_macro_rules)]
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;

/// Declare a `static` `RwLock`.  Under std, uses `const` init.  Under loom,
/// uses `loom::lazy_static!`.
#[allow(unused_macro_rules)]
macro_rules! static_rwlock {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
    (static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_rwlock;
