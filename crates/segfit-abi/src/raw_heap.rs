//! Heap provider backed by one raw system allocation.
//!
//! Pointers handed to C callers are derived from the allocation's root
//! pointer, and the allocator reaches heap memory only through that same
//! root, one word, copy or payload range at a time. No reference ever spans
//! bytes that a caller owns, so earlier pointers stay valid across later
//! allocator calls and callers on other threads may write their payloads
//! while the lock is held elsewhere.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use segfit_core::malloc::{ALIGNMENT, HeapProvider, MAX_HEAP_PAGES, PAGE_SIZE, TagMemory};

/// `max_pages` pages of zeroed memory, committed one page per `grow`.
#[derive(Debug)]
pub struct RawPageHeap {
    root: NonNull<u8>,
    layout: Layout,
    committed: usize,
    max_pages: usize,
}

// SAFETY: the heap uniquely owns its allocation; the raw pointer is only an
// address that is never shared with another `RawPageHeap`.
unsafe impl Send for RawPageHeap {}

impl RawPageHeap {
    /// Reserves `max_pages` pages (clamped to `1..=MAX_HEAP_PAGES`).
    ///
    /// `None` if the system allocator refuses the reservation.
    #[must_use]
    pub fn new(max_pages: usize) -> Option<Self> {
        let max_pages = max_pages.clamp(1, MAX_HEAP_PAGES);
        let size = max_pages.checked_mul(PAGE_SIZE)?;
        let layout = Layout::from_size_align(size, ALIGNMENT).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let root = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self {
            root,
            layout,
            committed: 0,
            max_pages,
        })
    }

    /// Real address of heap offset 0. Stable for the life of the heap.
    #[must_use]
    pub fn base_ptr(&self) -> *mut u8 {
        self.root.as_ptr()
    }

    /// Page limit of this heap.
    #[must_use]
    pub const fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Pointer to `len` committed bytes at `offset`.
    ///
    /// Out-of-range accesses are allocator bugs and must not reach memory.
    fn range(&self, offset: usize, len: usize) -> *mut u8 {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.committed);
        assert!(
            in_bounds,
            "heap access {offset:#x}+{len} outside committed {:#x}",
            self.committed
        );
        self.root.as_ptr().wrapping_add(offset)
    }
}

impl Drop for RawPageHeap {
    fn drop(&mut self) {
        // SAFETY: `root` came from `alloc_zeroed(self.layout)` and is freed once.
        unsafe { dealloc(self.root.as_ptr(), self.layout) };
    }
}

impl TagMemory for RawPageHeap {
    fn load_word(&self, offset: usize) -> u64 {
        let ptr = self.range(offset, size_of::<u64>());
        // SAFETY: `range` checked the word lies inside the live allocation.
        unsafe { ptr.cast::<u64>().read_unaligned() }
    }

    fn store_word(&mut self, offset: usize, word: u64) {
        let ptr = self.range(offset, size_of::<u64>());
        // SAFETY: as in `load_word`; `&mut self` serializes allocator writes.
        unsafe { ptr.cast::<u64>().write_unaligned(word) };
    }
}

impl HeapProvider for RawPageHeap {
    fn grow(&mut self) -> Option<usize> {
        if self.committed / PAGE_SIZE >= self.max_pages {
            return None;
        }
        let page = self.committed;
        self.committed += PAGE_SIZE;
        Some(page)
    }

    fn start(&self) -> usize {
        0
    }

    fn end(&self) -> usize {
        self.committed
    }

    fn slice(&self, offset: usize, len: usize) -> &[u8] {
        let ptr = self.range(offset, len);
        // SAFETY: in bounds; the borrow of `self` keeps the allocation alive.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        let ptr = self.range(offset, len);
        // SAFETY: in bounds; the exclusive borrow of `self` covers the range.
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }

    fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        let from = self.range(src, len);
        let to = self.range(dst, len);
        // SAFETY: both ranges are in bounds; `copy` allows overlap.
        unsafe { std::ptr::copy(from, to, len) };
    }
}
