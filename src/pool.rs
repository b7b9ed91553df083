//! The public facade: per-thread caches over one process-wide hierarchy.
//!
//! The [`CentralCache`] and [`PageCache`] behind [`allocate`] and [`release`] are built once,
//! on first use, and live for the rest of the process. Every thread gets its own
//! [`ThreadCache`] on its first call, which is dropped together with the thread.

use core::cell::RefCell;
use core::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::caches::{CentralCache, PageCache, ThreadCache};
use crate::freelist::FreeBlock;
use crate::size_class::{SizeClass, ALIGNMENT, MAX_ALLOC_SIZE};
use crate::util::{raw_ptr, system_allocate, system_release};

#[cfg(feature = "nightly")]
use core::alloc::{AllocError, Allocator, Layout};

static CENTRAL: OnceLock<Arc<CentralCache>> = OnceLock::new();

thread_local! {
    static THREAD_CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new(Arc::clone(central())));
}

fn central() -> &'static Arc<CentralCache> {
    CENTRAL.get_or_init(|| Arc::new(CentralCache::new(Arc::new(PageCache::new()))))
}

/// Returns a pointer to at least `size` usable bytes, or null if memory is exhausted.
///
/// A `size` of 0 is served like a minimum-size request. The block is [`ALIGNMENT`]-aligned.
#[inline]
pub fn allocate(size: usize) -> *mut u8 {
    raw_ptr(try_allocate(size).ok())
}

/// Gives a block back to the pool. Null pointers are ignored.
///
/// # Safety
/// `ptr` must have been returned by [`allocate`] (or a [`MemoryPool`]) with exactly the same
/// `size`, and must not be used afterwards. The pool keeps no record of block sizes.
#[inline]
pub unsafe fn release(ptr: *mut u8, size: usize) {
    if let Some(ptr) = NonNull::new(ptr) {
        try_release(ptr, size);
    }
}

fn try_allocate(size: usize) -> Result<NonNull<u8>, ()> {
    THREAD_CACHE
        .try_with(|cache| cache.borrow_mut().allocate(size))
        .unwrap_or_else(|_| allocate_uncached(size))
}

unsafe fn try_release(ptr: NonNull<u8>, size: usize) {
    if THREAD_CACHE
        .try_with(|cache| cache.borrow_mut().release(ptr, size))
        .is_err()
    {
        release_uncached(ptr, size);
    }
}

/// Serves a request without a thread cache, once it has been torn down.
#[cold]
fn allocate_uncached(size: usize) -> Result<NonNull<u8>, ()> {
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_ALLOC_SIZE {
        return system_allocate(size);
    }
    trace!(size, "Thread cache is gone, going to the central cache.");
    let central = central();
    let index = SizeClass::index(size);
    let run = central.fetch_memory(index)?;
    unsafe {
        if let Some(rest) = NonNull::new((*run.as_ptr()).next) {
            (*run.as_ptr()).next = core::ptr::null_mut();
            central.return_memory(rest, index);
        }
    }
    Ok(run.cast())
}

/// Returns a single block without a thread cache, once it has been torn down.
#[cold]
unsafe fn release_uncached(ptr: NonNull<u8>, size: usize) {
    if size > MAX_ALLOC_SIZE {
        system_release(ptr, size);
        return;
    }
    trace!(size, "Thread cache is gone, going to the central cache.");
    let block = ptr.cast::<FreeBlock>();
    block.as_ptr().write(FreeBlock { next: core::ptr::null_mut() });
    central().return_memory(block, SizeClass::index(size));
}

/// Handle to the process-wide pool.
///
/// All handles share the same hierarchy, so a block may be released through any of them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPool;

impl MemoryPool {
    /// See [`allocate`](crate::allocate).
    #[inline]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        allocate(size)
    }

    /// See [`release`](crate::release).
    ///
    /// # Safety
    /// Same contract as [`release`](crate::release).
    #[inline]
    pub unsafe fn release(&self, ptr: *mut u8, size: usize) {
        release(ptr, size)
    }
}

/// Number of bytes actually usable in a block served for `size`.
#[cfg(feature = "nightly")]
fn usable_size(size: usize) -> usize {
    match size {
        0 => ALIGNMENT,
        s if s <= MAX_ALLOC_SIZE => SizeClass::round_up(s),
        s => s,
    }
}

//---------------impl Allocator for MemoryPool---------------//

#[cfg(feature = "nightly")]
unsafe impl Allocator for MemoryPool {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGNMENT {
            return std::alloc::System.allocate(layout);
        }
        let ptr = try_allocate(layout.size()).map_err(|()| AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, usable_size(layout.size())))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.align() > ALIGNMENT {
            return std::alloc::System.deallocate(ptr, layout);
        }
        try_release(ptr, layout.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::PAGE_SIZE;
    use std::thread;

    #[test]
    fn test_round_trip() {
        for size in [1, 7, 8, 100, 4096, PAGE_SIZE * 9, MAX_ALLOC_SIZE] {
            let p = allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            unsafe {
                p.write_bytes(0xC3, size);
                release(p, size);
            }
            let q = allocate(size);
            assert_eq!(p, q, "A just released block should be reused by the same thread.");
            unsafe { release(q, size) };
        }
    }

    #[test]
    fn test_null_release() {
        unsafe { release(core::ptr::null_mut(), 16) };
    }

    #[test]
    fn test_handles_share_the_pool() {
        let p = MemoryPool.allocate(24);
        unsafe { release(p, 24) };
        assert_eq!(allocate(24), p);
        unsafe { MemoryPool.release(p, 24) };
    }

    #[test]
    fn test_uncached_paths() {
        let p = allocate_uncached(1336).unwrap();
        unsafe { release_uncached(p, 1336) };
        assert_eq!(allocate_uncached(1336).unwrap(), p);

        let big = allocate_uncached(MAX_ALLOC_SIZE + 8).unwrap();
        unsafe { release_uncached(big, MAX_ALLOC_SIZE + 8) };
    }

    #[test]
    fn test_release_from_thread_destructor() {
        struct ReleaseOnExit(usize);

        impl Drop for ReleaseOnExit {
            fn drop(&mut self) {
                unsafe { release(self.0 as *mut u8, 64) };
            }
        }

        thread_local! {
            static GUARD: RefCell<Option<ReleaseOnExit>> = const { RefCell::new(None) };
        }

        thread::spawn(|| {
            let p = allocate(64);
            assert!(!p.is_null());
            GUARD.with(|g| *g.borrow_mut() = Some(ReleaseOnExit(p as usize)));
        })
        .join()
        .expect("Thread panicked.");
    }

    #[cfg(feature = "nightly")]
    #[test]
    fn test_allocator_api() {
        let mut v: Vec<u64, MemoryPool> = Vec::new_in(MemoryPool);
        for i in 0..10_000 {
            v.push(i);
        }
        assert_eq!(v.iter().sum::<u64>(), (0..10_000).sum());

        #[repr(align(64))]
        struct Wide([u8; 64]);
        let b = Box::new_in(Wide([7; 64]), MemoryPool);
        assert_eq!(&*b as *const Wide as usize % 64, 0);
    }
}
