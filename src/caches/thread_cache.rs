//! The per-thread front end.
//!
//! A [`ThreadCache`] is owned by exactly one thread and is never locked. It keeps a private
//! free list per size class, refills an empty list from the [`CentralCache`] and hands
//! three quarters of a list back once it grows to [`SPILL_THRESHOLD`] blocks.

use core::ptr::NonNull;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, instrument, trace, Level};

use super::CentralCache;
use crate::freelist::{run_len, FreeList};
use crate::size_class::{SizeClass, ALIGNMENT, FREE_LIST_SIZE, MAX_ALLOC_SIZE};
use crate::sources::{MmapSource, PageSource};
use crate::util::{system_allocate, system_release};

/// Local list length at which blocks are handed back to the central cache.
pub const SPILL_THRESHOLD: usize = 64;

pub struct ThreadCache<S: PageSource = MmapSource> {
    lists: Box<[FreeList]>,
    /// Number of blocks in each of `lists`.
    lengths: Box<[usize]>,
    central: Arc<CentralCache<S>>,
}

impl<S: PageSource> ThreadCache<S> {
    pub fn new(central: Arc<CentralCache<S>>) -> Self {
        ThreadCache {
            lists: (0..FREE_LIST_SIZE).map(|_| FreeList::new()).collect(),
            lengths: vec![0; FREE_LIST_SIZE].into_boxed_slice(),
            central,
        }
    }

    pub fn central(&self) -> &Arc<CentralCache<S>> {
        &self.central
    }

    /// Number of blocks of the class at `index` currently held by this cache.
    pub fn cached(&self, index: usize) -> usize {
        self.lengths[index]
    }

    /// Returns a block of at least `size` bytes, or `Err(())` if memory is exhausted.
    ///
    /// A `size` of 0 is served like [`ALIGNMENT`]. Sizes over [`MAX_ALLOC_SIZE`]
    /// are passed through to the system allocator.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, ()> {
        let size = if size == 0 { ALIGNMENT } else { size };
        if size > MAX_ALLOC_SIZE {
            return system_allocate(size);
        }

        let index = SizeClass::index(size);
        if let Some(block) = unsafe { self.lists[index].pop_front() } {
            self.lengths[index] -= 1;
            trace!(size, ?block, "Thread cache hit.");
            return Ok(block.cast());
        }

        self.fetch_from_central(index)
    }

    /// Gives a block back to the cache.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](ThreadCache::allocate) of a cache sharing
    /// this cache's central cache, called with the same `size`, and must not be used afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        if size > MAX_ALLOC_SIZE {
            system_release(ptr, size);
            return;
        }

        let index = SizeClass::index(size);
        self.lists[index].push_front(ptr.cast());
        self.lengths[index] += 1;
        trace!(size, ?ptr, "Block cached.");

        if self.lengths[index] >= SPILL_THRESHOLD {
            self.return_to_central(index);
        }
    }

    /// Refills the list of the class at `index` and returns one block of it.
    #[instrument(level = "debug", skip(self), ret(level = Level::TRACE), err(Debug, level = Level::ERROR))]
    fn fetch_from_central(&mut self, index: usize) -> Result<NonNull<u8>, ()> {
        let run = self.central.fetch_memory(index)?;

        // The central cache currently hands out one block per call, keep whatever else comes.
        let rest = unsafe { (*run.as_ptr()).next };
        if let Some(rest) = NonNull::new(rest) {
            unsafe {
                (*run.as_ptr()).next = core::ptr::null_mut();
                let count = run_len(rest.as_ptr());
                self.lists[index].push_run(rest);
                self.lengths[index] += count;
                debug!(count, "Kept extra blocks from the central cache.");
            }
        }
        Ok(run.cast())
    }

    /// Keeps a quarter of the list of the class at `index` and returns the rest to the central cache.
    #[instrument(level = "debug", skip(self))]
    fn return_to_central(&mut self, index: usize) {
        let keep = self.lengths[index] / 4;
        let Some(rest) = (unsafe { self.lists[index].split_after(keep) }) else {
            return;
        };
        debug!(kept = keep, returned = self.lengths[index] - keep, "Spilling to the central cache.");
        self.lengths[index] = keep;
        unsafe { self.central.return_memory(rest, index) };
    }

    /// Takes every cached block of the class at `index` out of the cache.
    #[cfg(test)]
    fn drain(&mut self, index: usize) -> Option<NonNull<crate::freelist::FreeBlock>> {
        self.lengths[index] = 0;
        unsafe { self.lists[index].split_after(0) }
    }
}

impl<S: PageSource> Debug for ThreadCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("cached", &self.lengths.iter().sum::<usize>())
            .field("central", &self.central)
            .finish()
    }
}
