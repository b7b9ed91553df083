//! Defines the intrusive [`FreeList`] and associated functions.
//!
//! A free block doubles as a list node: its first machine word holds the address of the
//! next free block of the same size class, or null at the tail. No other metadata is kept,
//! so a block is either linked into exactly one list or owned by a caller.
//!
//! Reading and writing that word through a [`FreeBlock`] pointer is deliberate type punning.
//! It is only sound for blocks that are at least one word large and word-aligned,
//! which every size class guarantees (see [`ALIGNMENT`](crate::size_class::ALIGNMENT)).

use core::mem::{align_of, size_of};
use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

use crate::size_class::ALIGNMENT;

const_assert!(size_of::<FreeBlock>() <= ALIGNMENT);
const_assert!(align_of::<FreeBlock>() <= ALIGNMENT);

/// View over the first word of a free block.
#[repr(C)]
pub struct FreeBlock {
    pub next: *mut FreeBlock,
}

/// A singly linked list of free blocks, threaded through the blocks themselves.
#[derive(Debug)]
#[repr(C)]
pub struct FreeList {
    head: *mut FreeBlock,
}

// SAFETY: the blocks are plain memory, whoever owns the list owns them.
unsafe impl Send for FreeList {}

impl FreeList {
    /// Creates an empty FreeList.
    #[inline]
    pub const fn new() -> Self {
        FreeList { head: null_mut() }
    }

    /// Returns the head of the list or `None` if the list is empty.
    #[inline]
    pub fn head(&self) -> Option<NonNull<FreeBlock>> {
        NonNull::new(self.head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Turns the block at `p` into a node and links it as the new head.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// `p` must point to a word-aligned block of at least one word that is not linked
    /// into any list and that the caller no longer uses.
    #[inline]
    pub unsafe fn push_front(&mut self, p: NonNull<FreeBlock>) {
        debug_assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        p.as_ptr().write(FreeBlock { next: self.head });
        self.head = p.as_ptr();
    }

    /// Unlinks the head and returns it detached (its link is cleared),
    /// or `None` if the list is empty.
    /// This operation has a time complexity of *O*(1).
    ///
    /// # Safety
    /// Every node of the list must be a valid free block.
    #[inline]
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<FreeBlock>> {
        let head = NonNull::new(self.head)?;
        self.head = (*head.as_ptr()).next;
        (*head.as_ptr()).next = null_mut();
        Some(head)
    }

    /// Prepends a null-terminated run of blocks to the list.
    /// This operation walks the run to find its tail, *O*(run length).
    ///
    /// # Safety
    /// `run` must be the head of a null-terminated chain of valid free blocks
    /// none of which is part of this or any other list.
    pub unsafe fn push_run(&mut self, run: NonNull<FreeBlock>) {
        let tail = tail_of(run);
        (*tail.as_ptr()).next = self.head;
        self.head = run.as_ptr();
    }

    /// Keeps the first `keep` blocks and returns the remainder as a detached,
    /// null-terminated run, or `None` if the list holds no more than `keep` blocks.
    ///
    /// # Safety
    /// Every node of the list must be a valid free block.
    pub unsafe fn split_after(&mut self, keep: usize) -> Option<NonNull<FreeBlock>> {
        if keep == 0 {
            return NonNull::new(core::mem::replace(&mut self.head, null_mut()));
        }
        let mut cur = NonNull::new(self.head)?;
        for _ in 1..keep {
            cur = NonNull::new((*cur.as_ptr()).next)?;
        }
        let rest = NonNull::new((*cur.as_ptr()).next)?;
        (*cur.as_ptr()).next = null_mut();
        Some(rest)
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Slices `count` blocks of `block_size` bytes starting at `start` and links them in
/// increasing address order. The last block is null-terminated.
///
/// # Safety
/// `[start, start + count * block_size)` must be writable memory owned by the caller,
/// `start` must be [`ALIGNMENT`]-aligned and `block_size` a nonzero multiple of it.
pub unsafe fn carve(start: NonNull<u8>, block_size: usize, count: usize) -> NonNull<FreeBlock> {
    debug_assert!(count > 0);
    debug_assert_eq!(block_size % ALIGNMENT, 0);
    debug_assert_eq!(start.as_ptr() as usize % ALIGNMENT, 0);

    let base = start.as_ptr();
    for i in 0..count {
        let block: *mut FreeBlock = base.add(i * block_size).cast();
        let next: *mut FreeBlock = if i + 1 < count {
            base.add((i + 1) * block_size).cast()
        } else {
            null_mut()
        };
        block.write(FreeBlock { next });
    }
    start.cast()
}

/// Returns the number of blocks in the null-terminated chain starting at `run`.
///
/// # Safety
/// `run` must be null or the head of a null-terminated chain of valid free blocks.
pub unsafe fn run_len(run: *const FreeBlock) -> usize {
    let mut len = 0;
    let mut cur = run;
    while !cur.is_null() {
        len += 1;
        cur = (*cur).next;
    }
    len
}

/// # Safety
/// `run` must be the head of a null-terminated chain of valid free blocks.
#[inline]
unsafe fn tail_of(run: NonNull<FreeBlock>) -> NonNull<FreeBlock> {
    let mut tail = run;
    while let Some(next) = NonNull::new((*tail.as_ptr()).next) {
        tail = next;
    }
    tail
}
