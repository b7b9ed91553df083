//! The shared middle tier: one spin-locked free list per size class.
//!
//! A miss pulls one span from the [`PageCache`] and slices it into blocks of the class size.
//! Blocks are never reassembled into spans, once carved they stay in the size-classed lists.

use core::ptr::NonNull;
use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, instrument, trace, Level};

use super::PageCache;
use crate::freelist::{self, FreeBlock, FreeList};
use crate::size_class::{span_pages_for, SizeClass, FREE_LIST_SIZE, PAGE_SIZE, SPAN_PAGES};
use crate::sources::{MmapSource, PageSource};
use crate::spin::SpinLock;

pub struct CentralCache<S: PageSource = MmapSource> {
    lists: Box<[SpinLock<FreeList>]>,
    page_cache: Arc<PageCache<S>>,
}

impl<S: PageSource> CentralCache<S> {
    /// Creates a central cache with empty lists that carves spans from `page_cache`.
    pub fn new(page_cache: Arc<PageCache<S>>) -> Self {
        CentralCache {
            lists: (0..FREE_LIST_SIZE).map(|_| SpinLock::new(FreeList::new())).collect(),
            page_cache,
        }
    }

    pub fn page_cache(&self) -> &Arc<PageCache<S>> {
        &self.page_cache
    }

    /// Hands out one block of the class at `index` as a detached run.
    /// Returns `Err(())` for an out-of-range index or when no span can be had.
    ///
    /// The class lock is not held while the page cache is consulted, so two
    /// concurrent misses may both carve a span. Both remainders end up in the list.
    #[instrument(level = "debug", skip(self), ret(level = Level::TRACE), err(Debug, level = Level::ERROR))]
    pub fn fetch_memory(&self, index: usize) -> Result<NonNull<FreeBlock>, ()> {
        let Some(slot) = self.lists.get(index) else {
            return Err(());
        };

        let popped = unsafe { slot.lock().pop_front() };
        if let Some(block) = popped {
            trace!(?block, "Central list hit.");
            return Ok(block);
        }

        let block_size = SizeClass::block_size(index);
        let span_pages = span_pages_for(block_size);
        let start = self.page_cache.allocate_span(span_pages)?;

        let count = (SPAN_PAGES * PAGE_SIZE) / block_size;
        if count <= 1 {
            debug!(span_pages, "Span holds a single block, handing it out whole.");
            return Ok(start.cast());
        }

        debug!(count, block_size, "Carving span.");
        // The span is ours until the remainder is published.
        let run = unsafe { freelist::carve(start, block_size, count) };
        unsafe {
            let rest = (*run.as_ptr()).next;
            (*run.as_ptr()).next = core::ptr::null_mut();
            if let Some(rest) = NonNull::new(rest) {
                slot.lock().push_run(rest);
            }
        }
        Ok(run)
    }

    /// Prepends a run of blocks to the list of the class at `index`.
    /// Out-of-range indices are ignored.
    ///
    /// # Safety
    /// `run` must head a null-terminated chain of free blocks of the class at `index`
    /// which the caller no longer uses and which is not linked into any other list.
    #[instrument(level = "debug", skip(self))]
    pub unsafe fn return_memory(&self, run: NonNull<FreeBlock>, index: usize) {
        let Some(slot) = self.lists.get(index) else {
            debug!("Index out of range, ignoring.");
            return;
        };
        slot.lock().push_run(run);
    }
}

impl<S: PageSource> Debug for CentralCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralCache")
            .field("page_cache", &self.page_cache)
            .finish_non_exhaustive()
    }
}
