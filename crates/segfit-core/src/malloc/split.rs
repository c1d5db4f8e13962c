//! Splitting and coalescing of adjacent blocks.
//!
//! These only rewrite boundary tags. Free-list membership of the blocks
//! involved is the caller's business.

use super::layout::{MIN_BLOCK_SIZE, TagMemory, block_size, is_allocated, write_tags};

/// Shrinks `block` to `request` bytes and writes a free remainder after it.
///
/// The block keeps its allocated bit. Returns the remainder's offset; it is
/// not on any list yet. Callers must have ruled out a splinter.
pub fn split<M: TagMemory + ?Sized>(bytes: &mut M, block: usize, request: usize) -> usize {
    let size = block_size(bytes, block);
    debug_assert!(size >= request + MIN_BLOCK_SIZE, "split would splinter");
    let allocated = is_allocated(bytes, block);
    write_tags(bytes, block, request, allocated);
    let remainder = block + request;
    write_tags(bytes, remainder, size - request, false);
    remainder
}

/// Merges two physically adjacent free blocks; the lower offset survives.
pub fn coalesce_blocks<M: TagMemory + ?Sized>(bytes: &mut M, a: usize, b: usize) -> usize {
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    let low_size = block_size(bytes, low);
    debug_assert_eq!(low + low_size, high, "coalescing non-adjacent blocks");
    let merged = low_size + block_size(bytes, high);
    write_tags(bytes, low, merged, false);
    low
}

/// Extends the wilderness block by one freshly grown page.
pub fn coalesce_with_grown_page<M: TagMemory + ?Sized>(
    bytes: &mut M,
    wilderness: usize,
    page_size: usize,
) -> usize {
    let grown = block_size(bytes, wilderness) + page_size;
    write_tags(bytes, wilderness, grown, false);
    wilderness
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::layout::{PAGE_SIZE, footer_offset, header, read_word};

    #[test]
    fn split_keeps_allocated_bit_on_lower_part() {
        let mut bytes = vec![0u8; 512];
        write_tags(&mut bytes, 0, 256, true);
        let remainder = split(&mut bytes, 0, 96);
        assert_eq!(remainder, 96);
        assert_eq!(block_size(&bytes, 0), 96);
        assert!(is_allocated(&bytes, 0));
        assert_eq!(read_word(&bytes, footer_offset(0, 96)), header(&bytes, 0));
        assert_eq!(block_size(&bytes, remainder), 160);
        assert!(!is_allocated(&bytes, remainder));
        assert_eq!(read_word(&bytes, footer_offset(96, 160)), 160);
    }

    #[test]
    fn coalesce_keeps_lower_block_in_either_order() {
        let mut bytes = vec![0u8; 512];
        write_tags(&mut bytes, 32, 64, false);
        write_tags(&mut bytes, 96, 128, false);
        assert_eq!(coalesce_blocks(&mut bytes, 96, 32), 32);
        assert_eq!(block_size(&bytes, 32), 192);
        assert_eq!(read_word(&bytes, footer_offset(32, 192)), 192);

        write_tags(&mut bytes, 224, 32, false);
        assert_eq!(coalesce_blocks(&mut bytes, 32, 224), 32);
        assert_eq!(block_size(&bytes, 32), 224);
    }

    #[test]
    fn grown_page_extends_wilderness() {
        let mut bytes = vec![0u8; 3 * PAGE_SIZE];
        write_tags(&mut bytes, 56, 1984, false);
        assert_eq!(coalesce_with_grown_page(&mut bytes, 56, PAGE_SIZE), 56);
        assert_eq!(block_size(&bytes, 56), 1984 + PAGE_SIZE);
        assert_eq!(read_word(&bytes, 2 * PAGE_SIZE - 16), (1984 + PAGE_SIZE) as u64);
    }
}
