//! Memory allocation.
//!
//! Segregated-fit allocator with boundary tags:
//! - `layout`: tag encoding, heap constants and the size-class table
//! - `free_list`: one sentinel-headed list per class plus the wilderness slot
//! - `split`: splitting and coalescing of adjacent blocks
//! - `heap`: the page-growth provider seam
//! - `allocator`: malloc/free/realloc over all of the above
//! - `check`: heap walk and invariant verification

pub mod allocator;
pub mod check;
pub mod free_list;
pub mod heap;
pub mod layout;
pub mod split;

pub use allocator::{AllocatorLogLevel, AllocatorLogRecord, HeapPhase, MallocState};
pub use check::{BlockInfo, HeapStats};
pub use free_list::FreeLists;
pub use heap::{ArenaHeap, HeapProvider};
pub use layout::{
    ALIGNMENT, MAX_HEAP_PAGES, MIN_BLOCK_SIZE, NUM_FREE_LISTS, PAGE_SIZE, TAG_OVERHEAD,
    TagMemory, WILDERNESS_CLASS,
};
