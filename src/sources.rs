//! [`PageSource`] trait and structures that implement it.
//!
//! A page source is where the [`PageCache`](crate::caches::PageCache) gets fresh memory
//! from when none of its free spans is large enough. Spans are never handed back,
//! so a source only has to know how to give memory out.

use core::ptr::{null_mut, NonNull};

use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use tracing::{error, instrument, Level};

use crate::size_class::PAGE_SIZE;

/// A provider of page-aligned, zero-filled memory.
///
/// # Safety
/// Implementors must return regions of at least `pages * PAGE_SIZE` bytes that are
/// [`PAGE_SIZE`]-aligned, zero-filled, readable, writable and not handed out to anyone
/// else for as long as the source (or any copy of the returned pointer) lives.
pub unsafe trait PageSource {
    /// Acquires `pages` fresh pages.
    /// Returns the start of the region or `Err(())` if no memory is available.
    fn acquire(&mut self, pages: usize) -> Result<NonNull<u8>, ()>;
}

/// A source that maps anonymous private memory with [`libc::mmap`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

impl MmapSource {
    #[inline(always)]
    pub const fn new() -> Self {
        MmapSource
    }
}

unsafe impl PageSource for MmapSource {
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn acquire(&mut self, pages: usize) -> Result<NonNull<u8>, ()> {
        let len = pages.checked_mul(PAGE_SIZE).ok_or(())?;
        if len == 0 {
            return Err(());
        }
        // Anonymous mappings are zero-filled by the kernel.
        let p = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            error!(len, "mmap failed.");
            return Err(());
        }
        debug_assert_eq!(p as usize % PAGE_SIZE, 0);
        NonNull::new(p.cast()).ok_or(())
    }
}

unsafe impl<T: PageSource + ?Sized> PageSource for &mut T {
    fn acquire(&mut self, pages: usize) -> Result<NonNull<u8>, ()> {
        (**self).acquire(pages)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use arena_source::ArenaSource;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_mmap_source() {
        let mut source = MmapSource::new();
        let p = source.acquire(3).unwrap();
        assert_eq!(p.as_ptr() as usize % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts_mut(p.as_ptr(), 3 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0), "Fresh pages should be zeroed.");
        bytes.fill(0xAB);
        assert!(source.acquire(0).is_err());
        assert!(source.acquire(usize::MAX).is_err());
    }

    #[test]
    fn test_arena_source() {
        let mut arena = ArenaSource::new(4);
        let base = arena.base().as_ptr();
        let count = arena.acquisitions();

        assert_eq!(arena.acquire(1).unwrap().as_ptr(), base);
        assert_eq!(arena.acquire(2).unwrap().as_ptr(), unsafe { base.add(PAGE_SIZE) });
        assert!(arena.acquire(2).is_err());
        assert_eq!(arena.acquire(1).unwrap().as_ptr(), unsafe { base.add(3 * PAGE_SIZE) });
        assert!(arena.acquire(1).is_err());
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_by_mut_ref() {
        let mut arena = ArenaSource::new(2);
        let mut source = &mut arena;
        assert!(PageSource::acquire(&mut source, 2).is_ok());
        assert!(arena.acquire(1).is_err());
    }
}
