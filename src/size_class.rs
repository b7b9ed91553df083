//! Size classes and the constants shared by every tier.
//!
//! Requests up to [`MAX_ALLOC_SIZE`] bytes are served from one of
//! [`FREE_LIST_SIZE`] size classes. Class `i` holds blocks of exactly
//! `(i + 1) * ALIGNMENT` bytes:
//!
//! | index | block size |
//! |-------|------------|
//! | 0     | 8          |
//! | 1     | 16         |
//! | 2     | 24         |
//! | ...   | ...        |
//! | 32767 | 256 KiB    |

use core::mem::size_of;

use static_assertions::const_assert;

/// Granularity of every block handed out by the size-classed path.
pub const ALIGNMENT: usize = 8;

/// Largest request served by the size-classed path, larger requests go to the system allocator.
pub const MAX_ALLOC_SIZE: usize = 256 * 1024;

/// Number of size classes.
pub const FREE_LIST_SIZE: usize = MAX_ALLOC_SIZE / ALIGNMENT;

/// Size of a page managed by the [`PageCache`](crate::caches::PageCache).
pub const PAGE_SIZE: usize = 4 * 1024;

/// Minimum number of pages fetched from the page cache on behalf of a size class.
pub const SPAN_PAGES: usize = 8;

// Free blocks store a forward link in their first word.
const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(ALIGNMENT >= size_of::<usize>());
const_assert!(MAX_ALLOC_SIZE % ALIGNMENT == 0);
const_assert!(PAGE_SIZE % ALIGNMENT == 0);
const_assert!(SPAN_PAGES * PAGE_SIZE >= ALIGNMENT);

/// Mapping between request sizes and size classes.
pub struct SizeClass;

impl SizeClass {
    /// Rounds `bytes` up to the next multiple of [`ALIGNMENT`].
    #[inline(always)]
    pub const fn round_up(bytes: usize) -> usize {
        (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }

    /// Returns the smallest class whose block size is at least `max(bytes, ALIGNMENT)`.
    ///
    /// The result is only a valid class index for `bytes <= MAX_ALLOC_SIZE`.
    #[inline(always)]
    pub const fn index(bytes: usize) -> usize {
        let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
        (bytes + ALIGNMENT - 1) / ALIGNMENT - 1
    }

    /// Returns the block size of the class at `index`.
    #[inline(always)]
    pub const fn block_size(index: usize) -> usize {
        (index + 1) * ALIGNMENT
    }
}

/// Returns the number of pages to request from the page cache when carving
/// blocks of `block_size` bytes.
///
/// Blocks that fit into a minimum span get [`SPAN_PAGES`] pages,
/// bigger blocks get exactly as many pages as a single block needs.
#[inline]
pub const fn span_pages_for(block_size: usize) -> usize {
    if block_size <= SPAN_PAGES * PAGE_SIZE {
        SPAN_PAGES
    } else {
        (block_size + PAGE_SIZE - 1) / PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(SizeClass::round_up(0), 0);
        assert_eq!(SizeClass::round_up(1), 8);
        assert_eq!(SizeClass::round_up(8), 8);
        assert_eq!(SizeClass::round_up(9), 16);
        assert_eq!(SizeClass::round_up(MAX_ALLOC_SIZE - 3), MAX_ALLOC_SIZE);
    }

    #[test]
    fn test_index_small_sizes() {
        assert_eq!(SizeClass::index(0), 0);
        assert_eq!(SizeClass::index(1), 0);
        assert_eq!(SizeClass::index(8), 0);
        assert_eq!(SizeClass::index(9), 1);
        assert_eq!(SizeClass::index(16), 1);
        assert_eq!(SizeClass::index(17), 2);
    }

    #[test]
    fn test_index_in_range() {
        assert_eq!(SizeClass::index(MAX_ALLOC_SIZE), FREE_LIST_SIZE - 1);
        for bytes in (1..=MAX_ALLOC_SIZE).step_by(7) {
            assert!(SizeClass::index(bytes) < FREE_LIST_SIZE);
        }
    }

    #[test]
    fn test_index_monotonic_and_fits() {
        let mut prev = 0;
        for bytes in 1..=MAX_ALLOC_SIZE {
            let index = SizeClass::index(bytes);
            assert!(index >= prev, "index({bytes}) went backwards");
            assert!(SizeClass::block_size(index) >= bytes);
            // The class below must be too small, so the class is the smallest fit.
            if index > 0 {
                assert!(SizeClass::block_size(index - 1) < bytes.max(ALIGNMENT));
            }
            prev = index;
        }
    }

    #[test]
    fn test_block_size_inverse() {
        for index in [0, 1, 2, 511, FREE_LIST_SIZE - 1] {
            assert_eq!(SizeClass::index(SizeClass::block_size(index)), index);
        }
    }

    #[test]
    fn test_span_pages_for() {
        assert_eq!(span_pages_for(8), SPAN_PAGES);
        assert_eq!(span_pages_for(SPAN_PAGES * PAGE_SIZE), SPAN_PAGES);
        assert_eq!(span_pages_for(SPAN_PAGES * PAGE_SIZE + 8), SPAN_PAGES + 1);
        assert_eq!(span_pages_for(MAX_ALLOC_SIZE), MAX_ALLOC_SIZE / PAGE_SIZE);
    }
}
