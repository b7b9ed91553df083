//! The page-level span allocator.
//
// # Implementation notes
// ## Span indices
// Every span the cache knows about has a record in `by_addr`, keyed by its base address.
// Free spans are additionally listed in `free`, bucketed by page count. A span that is
// in `by_addr` but in none of the buckets is checked out. Each bucket is a stack whose
// last element is the bucket head, so "prepend" is `push` and "unlink head" is `pop`.
//
// ## Coalescing
// Only the right neighbour of a released span is considered. The left neighbour is
// never looked up, so freeing `[A, A+k)` before `[A+k, A+k+m)` leaves two free spans.

use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument, trace, Level};

use crate::size_class::PAGE_SIZE;
use crate::sources::{MmapSource, PageSource};
use crate::util::checked_add;

/// A contiguous run of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: NonNull<u8>,
    pages: usize,
}

struct Spans<S> {
    /// Free spans by page count.
    free: BTreeMap<usize, Vec<usize>>,
    /// Every known span (free or checked out) by base address.
    by_addr: BTreeMap<usize, Span>,
    source: S,
}

// SAFETY: spans describe memory owned by the cache, not by a thread.
unsafe impl<S: Send> Send for Spans<S> {}

impl<S: PageSource> Spans<S> {
    /// Unlinks and returns the smallest free span with at least `pages` pages.
    fn take_best_fit(&mut self, pages: usize) -> Option<Span> {
        let (bucket_pages, addr) = {
            let (&bucket_pages, bucket) = self.free.range_mut(pages..).next()?;
            (bucket_pages, bucket.pop()?)
        };
        if self.free.get(&bucket_pages).is_some_and(Vec::is_empty) {
            self.free.remove(&bucket_pages);
        }
        let span = self.by_addr.get(&addr).copied();
        debug_assert_eq!(span.map(|s| s.pages), Some(bucket_pages));
        span
    }

    /// Links the span at `addr` as the head of the bucket for `pages`.
    fn push_free(&mut self, addr: usize, pages: usize) {
        self.free.entry(pages).or_default().push(addr);
    }

    /// Unlinks the span at `addr` from the bucket for `pages`.
    /// Returns `false` if it isn't there, i.e. the span is checked out.
    fn unlink_free(&mut self, addr: usize, pages: usize) -> bool {
        let Some(bucket) = self.free.get_mut(&pages) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|&a| a == addr) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.free.remove(&pages);
        }
        true
    }

    fn is_free(&self, addr: usize, pages: usize) -> bool {
        self.free.get(&pages).is_some_and(|bucket| bucket.contains(&addr))
    }
}

/// Owner of every span the allocator acquired from its [`PageSource`].
///
/// Spans are split to satisfy smaller requests and merged with their free right-hand
/// neighbour on release. They are never given back to the source.
pub struct PageCache<S: PageSource = MmapSource> {
    spans: Mutex<Spans<S>>,
}

impl PageCache<MmapSource> {
    /// Creates an empty page cache backed by [`MmapSource`].
    pub fn new() -> Self {
        Self::with_source(MmapSource::new())
    }
}

impl Default for PageCache<MmapSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: PageSource> PageCache<S> {
    /// Creates an empty page cache that takes fresh memory from `source`.
    pub fn with_source(source: S) -> Self {
        PageCache {
            spans: Mutex::new(Spans {
                free: BTreeMap::new(),
                by_addr: BTreeMap::new(),
                source,
            }),
        }
    }

    /// Checks out a span of exactly `pages` pages and returns its base address,
    /// or `Err(())` if `pages` is zero or the page source is exhausted.
    ///
    /// The smallest free span that is large enough is used and split if necessary,
    /// otherwise fresh pages are acquired from the source.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn allocate_span(&self, pages: usize) -> Result<NonNull<u8>, ()> {
        if pages == 0 {
            return Err(());
        }
        let mut spans = self.lock();

        if let Some(span) = spans.take_best_fit(pages) {
            debug!(start = ?span.start, span.pages, "Found free span.");
            let addr = span.start.as_ptr() as usize;

            if span.pages > pages {
                let rest = Span {
                    start: unsafe { NonNull::new_unchecked(span.start.as_ptr().add(pages * PAGE_SIZE)) },
                    pages: span.pages - pages,
                };
                let rest_addr = rest.start.as_ptr() as usize;
                debug!(rest_start = ?rest.start, rest.pages, "Splitting span.");
                spans.by_addr.insert(rest_addr, rest);
                spans.push_free(rest_addr, rest.pages);
            }

            spans.by_addr.insert(addr, Span { start: span.start, pages });
            return Ok(span.start);
        }

        debug!("No free span is large enough, acquiring pages from the source.");
        let start = spans.source.acquire(pages)?;
        debug_assert_eq!(start.as_ptr() as usize % PAGE_SIZE, 0);
        spans.by_addr.insert(start.as_ptr() as usize, Span { start, pages });
        Ok(start)
    }

    /// Returns the span starting at `ptr` to the cache, merging it with the
    /// span that immediately follows it if that one is free.
    ///
    /// Unknown addresses and spans that are already free are ignored.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate_span`](PageCache::allocate_span) on this cache with
    /// the same `pages`, and the span's memory must not be used after this call.
    #[instrument(level = "debug", skip(self))]
    pub unsafe fn release_span(&self, ptr: NonNull<u8>, pages: usize) {
        let mut spans = self.lock();
        let addr = ptr.as_ptr() as usize;

        let Some(mut span) = spans.by_addr.get(&addr).copied() else {
            debug!("Unknown span, ignoring.");
            return;
        };
        debug_assert_eq!(span.pages, pages, "Span released with a different page count.");
        if spans.is_free(addr, span.pages) {
            debug!("Span is already free, ignoring.");
            return;
        }

        let next = checked_add(ptr.as_ptr(), pages * PAGE_SIZE)
            .map(|p| p as usize)
            .and_then(|next_addr| spans.by_addr.get(&next_addr).copied());
        if let Some(next) = next {
            let next_addr = next.start.as_ptr() as usize;
            if spans.unlink_free(next_addr, next.pages) {
                debug!(next_start = ?next.start, next.pages, "Merging with successive free span.");
                span.pages += next.pages;
                spans.by_addr.remove(&next_addr);
            } else {
                trace!(next_start = ?next.start, "Successive span is checked out, not merging.");
            }
        }

        spans.by_addr.insert(addr, span);
        spans.push_free(addr, span.pages);
    }

    /// Returns the free spans as `(base address, page count)` sorted by address.
    pub fn free_spans(&self) -> Vec<(usize, usize)> {
        let spans = self.lock();
        let mut free: Vec<(usize, usize)> = spans
            .free
            .iter()
            .flat_map(|(&pages, bucket)| bucket.iter().map(move |&addr| (addr, pages)))
            .collect();
        free.sort_unstable();
        free
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Spans<S>> {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: PageSource> Debug for PageCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spans = self.lock();
        f.debug_struct("PageCache")
            .field("spans", &spans.by_addr.len())
            .field("free", &spans.free)
            .finish()
    }
}
