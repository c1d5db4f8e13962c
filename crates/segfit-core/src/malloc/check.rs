//! Heap walking and invariant checking.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::allocator::{HeapPhase, MallocState};
use super::heap::HeapProvider;
use super::layout::{
    ALLOCATED, EPILOGUE_SIZE, FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, NUM_FREE_LISTS, PADDING,
    PROLOGUE_OFFSET, PROLOGUE_SIZE, WILDERNESS_CLASS, class_for, footer_offset, header,
    pack, payload_of, read_word, unpack_allocated, unpack_size,
};
use crate::error::InvariantViolation;

/// One block found by walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Header offset.
    pub offset: usize,
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Payload offset (what `malloc` hands out).
    #[must_use]
    pub const fn payload(&self) -> usize {
        payload_of(self.offset)
    }
}

/// Totals gathered by [`MallocState::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeapStats {
    pub heap_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Size of the wilderness block, 0 when there is none.
    pub wilderness_size: usize,
}

impl<H: HeapProvider> MallocState<H> {
    /// Blocks between prologue and epilogue in address order.
    ///
    /// Stops early at the first header that cannot be stepped over.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        if self.phase() != HeapPhase::Ready {
            return out;
        }
        let mem = self.heap();
        let epilogue = self.heap_end() - EPILOGUE_SIZE;
        let mut offset = self.heap_start() + FIRST_BLOCK_OFFSET;
        while offset < epilogue {
            let word = header(mem, offset);
            let size = unpack_size(word);
            if size < MIN_BLOCK_SIZE || offset + size > epilogue {
                break;
            }
            out.push(BlockInfo {
                offset,
                size,
                allocated: unpack_allocated(word),
            });
            offset += size;
        }
        out
    }

    /// Checks every structural invariant of the heap and its free lists.
    pub fn verify(&self) -> Result<HeapStats, InvariantViolation> {
        if self.phase() != HeapPhase::Ready {
            return Err(InvariantViolation::Uninitialized);
        }
        let mem = self.heap();
        let start = self.heap_start();
        let epilogue = self.heap_end() - EPILOGUE_SIZE;

        let prologue = start + PROLOGUE_OFFSET;
        let prologue_word = pack(PROLOGUE_SIZE, true);
        if header(mem, prologue) != prologue_word
            || read_word(mem, footer_offset(prologue, PROLOGUE_SIZE)) != prologue_word
        {
            return Err(InvariantViolation::Prologue);
        }
        if read_word(mem, epilogue) != ALLOCATED {
            return Err(InvariantViolation::Epilogue(epilogue));
        }

        let mut stats = HeapStats {
            heap_bytes: self.heap_end() - start,
            ..HeapStats::default()
        };
        let mut free_sizes: HashMap<usize, usize> = HashMap::new();
        let mut previous_free: Option<usize> = None;
        let mut offset = start + FIRST_BLOCK_OFFSET;
        while offset < epilogue {
            let word = header(mem, offset);
            let size = unpack_size(word);
            if size < MIN_BLOCK_SIZE
                || word & !ALLOCATED != size as u64
                || offset + size > epilogue
            {
                return Err(InvariantViolation::BadSize { offset, size });
            }
            if read_word(mem, footer_offset(offset, size)) != word {
                return Err(InvariantViolation::TagMismatch(offset));
            }
            if unpack_allocated(word) {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
                previous_free = None;
            } else {
                if let Some(previous) = previous_free {
                    return Err(InvariantViolation::Uncoalesced(previous, offset));
                }
                stats.free_blocks += 1;
                stats.free_bytes += size;
                free_sizes.insert(offset, size);
                previous_free = Some(offset);
            }
            offset += size;
        }

        let expected = self.heap_end() - start - PADDING - PROLOGUE_SIZE - EPILOGUE_SIZE;
        let accounted = stats.allocated_bytes + stats.free_bytes;
        if offset != epilogue || accounted != expected {
            return Err(InvariantViolation::Accounting {
                accounted,
                expected,
            });
        }
        if stats.allocated_bytes != self.allocated_bytes() {
            return Err(InvariantViolation::Accounting {
                accounted: stats.allocated_bytes,
                expected: self.allocated_bytes(),
            });
        }

        let lists = self.free_lists();
        let mut listed: HashSet<usize> = HashSet::new();
        for class in 0..NUM_FREE_LISTS {
            if !lists.is_well_linked(class) {
                return Err(InvariantViolation::BrokenLinks(class));
            }
            for block in lists.iter(class) {
                let Some(&size) = free_sizes.get(&block) else {
                    return Err(InvariantViolation::StrayMember {
                        offset: block,
                        class,
                    });
                };
                if !listed.insert(block) {
                    return Err(InvariantViolation::StrayMember {
                        offset: block,
                        class,
                    });
                }
                let abuts_epilogue = block + size == epilogue;
                let misfiled = if class == WILDERNESS_CLASS {
                    false
                } else {
                    abuts_epilogue || class_for(size) != class
                };
                if misfiled {
                    return Err(InvariantViolation::WrongClass {
                        offset: block,
                        class,
                    });
                }
                if class == WILDERNESS_CLASS {
                    if !abuts_epilogue {
                        return Err(InvariantViolation::WildernessDetached(block));
                    }
                    stats.wilderness_size = size;
                }
            }
        }

        let wilderness_members = lists.len(WILDERNESS_CLASS);
        if wilderness_members > 1 {
            return Err(InvariantViolation::WildernessOverfull(wilderness_members));
        }
        if let Some(&block) = free_sizes.keys().find(|block| !listed.contains(block)) {
            return Err(InvariantViolation::Unlisted(block));
        }
        Ok(stats)
    }
}
