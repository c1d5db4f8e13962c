//! Block layout and size-class table.
//!
//! A block is addressed by the offset of its header inside the heap arena.
//! Header and footer are native-endian `u64` words holding `size | flags`;
//! sizes are multiples of 32 so the low five bits are free for flags. Every
//! tag mutation in the allocator goes through [`write_tags`] or
//! [`write_epilogue`] so header and footer can never drift apart.
//!
//! ```text
//! offset 0        24          56        end-8   end
//!        | padding | prologue | blocks.. | epilogue |
//! ```

/// Bytes per heap growth step.
pub const PAGE_SIZE: usize = 2048;
/// Payload alignment and block granularity.
pub const ALIGNMENT: usize = 32;
/// Smallest block able to hold header, two links and footer.
pub const MIN_BLOCK_SIZE: usize = 32;
/// Size of one boundary tag.
pub const WORD_SIZE: usize = 8;
/// Header plus footer overhead of every block.
pub const TAG_OVERHEAD: usize = 2 * WORD_SIZE;
/// Unused bytes at the start of the first page.
pub const PADDING: usize = 24;
/// Offset of the prologue block header.
pub const PROLOGUE_OFFSET: usize = PADDING;
/// Size of the allocated prologue block.
pub const PROLOGUE_SIZE: usize = MIN_BLOCK_SIZE;
/// Offset of the first real block header.
pub const FIRST_BLOCK_OFFSET: usize = PROLOGUE_OFFSET + PROLOGUE_SIZE;
/// The epilogue is a lone header word.
pub const EPILOGUE_SIZE: usize = WORD_SIZE;

/// Allocated flag (bit 0 of a tag word).
pub const ALLOCATED: u64 = 0x1;
const SIZE_MASK: u64 = !0x1f;

/// Number of segregated free lists.
pub const NUM_FREE_LISTS: usize = 8;
/// Index of the wilderness list.
pub const WILDERNESS_CLASS: usize = NUM_FREE_LISTS - 1;

/// Largest page limit any heap provider accepts (128 MiB of heap).
pub const MAX_HEAP_PAGES: usize = 1 << 16;

/// Packs a size and allocated bit into a tag word.
#[must_use]
pub const fn pack(size: usize, allocated: bool) -> u64 {
    let word = size as u64 & SIZE_MASK;
    if allocated { word | ALLOCATED } else { word }
}

/// Size portion of a tag word.
#[must_use]
pub const fn unpack_size(word: u64) -> usize {
    (word & SIZE_MASK) as usize
}

/// Allocated bit of a tag word.
#[must_use]
pub const fn unpack_allocated(word: u64) -> bool {
    word & ALLOCATED != 0
}

/// Header offset of the block owning `payload`.
#[must_use]
pub const fn block_of(payload: usize) -> usize {
    payload - WORD_SIZE
}

/// Payload offset of `block`.
#[must_use]
pub const fn payload_of(block: usize) -> usize {
    block + WORD_SIZE
}

/// Footer offset of a block of `size` bytes at `block`.
#[must_use]
pub const fn footer_offset(block: usize, size: usize) -> usize {
    block + size - WORD_SIZE
}

/// Word-granular access to heap memory.
///
/// Tag helpers only ever touch single words, so a provider never has to hand
/// out a reference spanning memory that payload owners are writing to.
pub trait TagMemory {
    /// Reads the native-endian word at `offset`.
    fn load_word(&self, offset: usize) -> u64;

    /// Writes the native-endian word at `offset`.
    fn store_word(&mut self, offset: usize, word: u64);
}

impl TagMemory for [u8] {
    fn load_word(&self, offset: usize) -> u64 {
        let mut raw = [0u8; WORD_SIZE];
        raw.copy_from_slice(&self[offset..offset + WORD_SIZE]);
        u64::from_ne_bytes(raw)
    }

    fn store_word(&mut self, offset: usize, word: u64) {
        self[offset..offset + WORD_SIZE].copy_from_slice(&word.to_ne_bytes());
    }
}

impl TagMemory for Vec<u8> {
    fn load_word(&self, offset: usize) -> u64 {
        self.as_slice().load_word(offset)
    }

    fn store_word(&mut self, offset: usize, word: u64) {
        self.as_mut_slice().store_word(offset, word);
    }
}

/// Reads the tag word at `offset`.
#[must_use]
pub fn read_word<M: TagMemory + ?Sized>(mem: &M, offset: usize) -> u64 {
    mem.load_word(offset)
}

/// Header word of `block`.
#[must_use]
pub fn header<M: TagMemory + ?Sized>(mem: &M, block: usize) -> u64 {
    mem.load_word(block)
}

/// Size recorded in the header of `block`.
#[must_use]
pub fn block_size<M: TagMemory + ?Sized>(mem: &M, block: usize) -> usize {
    unpack_size(header(mem, block))
}

/// Whether the header of `block` has the allocated bit set.
#[must_use]
pub fn is_allocated<M: TagMemory + ?Sized>(mem: &M, block: usize) -> bool {
    unpack_allocated(header(mem, block))
}

/// Writes a matching header and footer for a block of `size` bytes.
pub fn write_tags<M: TagMemory + ?Sized>(mem: &mut M, block: usize, size: usize, allocated: bool) {
    let word = pack(size, allocated);
    mem.store_word(block, word);
    mem.store_word(footer_offset(block, size), word);
}

/// Flips the allocated bit of an existing block, keeping its size.
pub fn set_allocated<M: TagMemory + ?Sized>(mem: &mut M, block: usize, allocated: bool) {
    let size = block_size(mem, block);
    write_tags(mem, block, size, allocated);
}

/// Writes the zero-size allocated epilogue for a heap ending at `end`.
pub fn write_epilogue<M: TagMemory + ?Sized>(mem: &mut M, end: usize) {
    mem.store_word(end - EPILOGUE_SIZE, pack(0, true));
}

/// Smallest 32-byte multiple holding `request` payload bytes plus both tags.
///
/// `None` when the computation overflows `usize`.
#[must_use]
pub const fn required_block_size(request: usize) -> Option<usize> {
    match request.checked_add(TAG_OVERHEAD + ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Free list for a block of `size` bytes (a multiple of 32).
///
/// Never returns the wilderness list; callers choose it explicitly.
#[must_use]
pub const fn class_for(size: usize) -> usize {
    match size / MIN_BLOCK_SIZE {
        0 | 1 => 0,
        2 => 1,
        3 => 2,
        4..=5 => 3,
        6..=8 => 4,
        9..=13 => 5,
        _ => 6,
    }
}

/// Splitting `size` down to `request` would leave an unusable sliver.
#[must_use]
pub const fn will_splinter(size: usize, request: usize) -> bool {
    size - request < MIN_BLOCK_SIZE
}
