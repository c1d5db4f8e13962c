//! Heap growth provider.
//!
//! The allocator never owns raw memory directly: it asks a [`HeapProvider`]
//! for one page at a time and addresses everything by offset from the heap
//! start. Heap memory is reached a word, a copy or an explicitly requested
//! payload range at a time, never as one slice over the whole heap, so a
//! provider backed by raw memory can keep handing out pointers into it.
//! [`ArenaHeap`] is the safe default provider, a fixed reservation that is
//! committed page by page and never moves.

use super::layout::{ALIGNMENT, MAX_HEAP_PAGES, PAGE_SIZE, TagMemory};

/// Source of heap pages.
///
/// Pages are contiguous and growth is irreversible: once `grow` returns
/// `None` the heap is exhausted for good. Every offset passed to the memory
/// methods lies inside `start()..end()`.
pub trait HeapProvider: TagMemory {
    /// Extends the heap by one page, returning the offset where it starts.
    fn grow(&mut self) -> Option<usize>;

    /// Offset of the first heap byte.
    fn start(&self) -> usize;

    /// Offset one past the last committed byte.
    fn end(&self) -> usize;

    /// The `len` committed bytes at `offset`.
    fn slice(&self, offset: usize, len: usize) -> &[u8];

    /// Mutable view of the `len` committed bytes at `offset`.
    fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8];

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    fn copy_within(&mut self, src: usize, dst: usize, len: usize);

    /// Bytes added by each `grow`.
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    /// Whether no page has been committed yet.
    fn is_empty(&self) -> bool {
        self.start() == self.end()
    }
}

/// Byte arena reserved once up front and committed page by page.
#[derive(Debug)]
pub struct ArenaHeap {
    buf: Vec<u8>,
    /// Bytes skipped so offset 0 sits on a 32-byte real address.
    skew: usize,
    committed: usize,
    max_pages: usize,
}

impl ArenaHeap {
    /// Reserves room for `max_pages` pages, clamped to `1..=MAX_HEAP_PAGES`.
    #[must_use]
    pub fn new(max_pages: usize) -> Self {
        let max_pages = max_pages.clamp(1, MAX_HEAP_PAGES);
        let buf = vec![0u8; max_pages * PAGE_SIZE + ALIGNMENT];
        let addr = buf.as_ptr() as usize;
        let skew = (ALIGNMENT - addr % ALIGNMENT) % ALIGNMENT;
        Self {
            buf,
            skew,
            committed: 0,
            max_pages,
        }
    }

    /// Page limit of this arena.
    #[must_use]
    pub const fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Pages committed so far.
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.committed / PAGE_SIZE
    }

    /// All committed bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.skew..self.skew + self.committed]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.skew..self.skew + self.committed]
    }
}

impl TagMemory for ArenaHeap {
    fn load_word(&self, offset: usize) -> u64 {
        self.bytes().load_word(offset)
    }

    fn store_word(&mut self, offset: usize, word: u64) {
        self.bytes_mut().store_word(offset, word);
    }
}

impl HeapProvider for ArenaHeap {
    fn grow(&mut self) -> Option<usize> {
        if self.pages() >= self.max_pages {
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
        &self.bytes()[offset..offset + len]
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.bytes_mut()[offset..offset + len]
    }

    fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.bytes_mut().copy_within(src..src + len, dst);
    }
}
