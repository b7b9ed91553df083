//! A size-classed memory pool organized as three tiers of caches.
//!
//! # Usage
//! ```
//! let p = tiered_malloc::allocate(100);
//! assert!(!p.is_null());
//! unsafe {
//!     p.write_bytes(0, 100);
//!     tiered_malloc::release(p, 100);
//! }
//! ```
//!
//! Callers remember the size of every block and pass it back on release, the pool keeps
//! no per-block header. Releasing with a different size, or releasing a pointer the pool
//! didn't hand out, is undefined behavior.
//!
//! # Mode of operation
//! Requests up to [`MAX_ALLOC_SIZE`] bytes are rounded up to one of [`FREE_LIST_SIZE`]
//! [size classes](size_class), each a multiple of [`ALIGNMENT`] bytes. Larger requests
//! are passed through to the system allocator.
//!
//! ## Thread cache
//! Every thread owns a [`ThreadCache`] with a private free list per size class.
//! Allocation pops the list head and release pushes onto it, neither takes a lock.
//! When a list runs dry the thread cache asks the central cache for more; when a list
//! grows to [`SPILL_THRESHOLD`] blocks, three quarters of it are handed back.
//!
//! ## Central cache
//! The [`CentralCache`] is shared by all threads and keeps one free list per size class,
//! each guarded by its own spin lock. When a list is empty it takes a span of pages from
//! the page cache and slices it into blocks of the class size.
//! Blocks never go back to the page cache.
//!
//! ## Page cache
//! The [`PageCache`] owns runs of [`PAGE_SIZE`]-byte pages called spans, indexed by page
//! count and by address under a single mutex. Requests are served best fit, splitting
//! larger spans. Released spans are merged with the free span right after them.
//! When nothing fits, fresh pages come from a [`PageSource`], by default `mmap`.
//!
//! ## Free lists
//! Free blocks are linked through their own first word, see [`freelist`].
//!
//! # Logging
//! The crate is instrumented with [`tracing`]. Slow paths open spans at `debug` level,
//! the lock-free fast path only emits `trace` events. No subscriber is installed.
//!
//! # Features
//! `nightly` implements [`Allocator`](core::alloc::Allocator) for [`MemoryPool`] so that
//! standard collections can live in the pool.
#![cfg_attr(feature = "nightly", feature(allocator_api))]

pub use crate::caches::{CentralCache, PageCache, ThreadCache, SPILL_THRESHOLD};
pub use crate::pool::{allocate, release, MemoryPool};
pub use crate::size_class::{
    SizeClass, ALIGNMENT, FREE_LIST_SIZE, MAX_ALLOC_SIZE, PAGE_SIZE, SPAN_PAGES,
};
pub use crate::sources::{MmapSource, PageSource};

pub mod caches;
pub mod freelist;
mod pool;
pub mod size_class;
pub mod sources;
mod spin;
#[cfg(test)]
mod testing;
mod util;
