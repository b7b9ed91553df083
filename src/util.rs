//! Utility functions.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use std::alloc::System;

use tracing::{error, trace};

use crate::size_class::ALIGNMENT;

#[inline(always)]
pub(crate) fn raw_ptr<T>(p: Option<NonNull<T>>) -> *mut T {
    p.map_or(null_mut(), |p| p.as_ptr())
}

#[inline(always)]
pub(crate) fn checked_add(ptr: *const u8, offset: usize) -> Option<*const u8> {
    (ptr as usize <= usize::MAX - offset).then(|| ptr.wrapping_add(offset))
}

/// Allocates `size` bytes with [`ALIGNMENT`] from the system allocator.
/// Sizes that can't form a [`Layout`] are reported as `Err(())`.
pub(crate) fn system_allocate(size: usize) -> Result<NonNull<u8>, ()> {
    let Ok(layout) = Layout::from_size_align(size, ALIGNMENT) else {
        error!(size, "Request too large for the system allocator.");
        return Err(());
    };
    trace!(size, "Passing through to the system allocator.");
    NonNull::new(unsafe { System.alloc(layout) }).ok_or(())
}

/// Frees a block obtained from [`system_allocate`].
///
/// # Safety
/// `ptr` must come from [`system_allocate`] called with the same `size`.
pub(crate) unsafe fn system_release(ptr: NonNull<u8>, size: usize) {
    let layout = Layout::from_size_align_unchecked(size, ALIGNMENT);
    System.dealloc(ptr.as_ptr(), layout);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::null;

    #[test]
    fn test_checked_add() {
        assert_eq!(checked_add(null(), 16), Some(16 as *const u8));
        assert_eq!(
            checked_add((usize::MAX - 15) as *const u8, 15),
            Some(usize::MAX as *const u8)
        );
        assert!(checked_add((usize::MAX - 15) as *const u8, 16).is_none());
    }

    #[test]
    fn test_raw_ptr() {
        let mut x = 7_u64;
        assert!(raw_ptr::<u64>(None).is_null());
        assert_eq!(raw_ptr(NonNull::new(&mut x as *mut u64)), &mut x as *mut u64);
    }

    #[test]
    fn test_system_round_trip() {
        let p = system_allocate(1 << 20).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        unsafe {
            p.as_ptr().write_bytes(1, 1 << 20);
            system_release(p, 1 << 20);
        }
        assert!(system_allocate(usize::MAX).is_err());
    }
}
