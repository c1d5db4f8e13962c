//! Core allocator state.
//!
//! Segregated-fit allocation over a boundary-tagged heap: first-fit search
//! through the size classes, splitting with splinter avoidance, immediate
//! coalescing on free, and a single wilderness block that absorbs every page
//! obtained from the [`HeapProvider`]. All addresses are byte offsets into
//! the heap; offset 0 is never a payload and doubles as null.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::free_list::FreeLists;
use super::heap::{ArenaHeap, HeapProvider};
use super::layout::{
    ALIGNMENT, ALLOCATED, EPILOGUE_SIZE, FIRST_BLOCK_OFFSET, MIN_BLOCK_SIZE, NUM_FREE_LISTS,
    PADDING, PROLOGUE_OFFSET, PROLOGUE_SIZE, TAG_OVERHEAD, WILDERNESS_CLASS, WORD_SIZE,
    block_of, block_size, class_for, footer_offset, header, is_allocated, payload_of, read_word,
    required_block_size, set_allocated, unpack_size, will_splinter, write_epilogue, write_tags,
};
use super::split::{coalesce_blocks, coalesce_with_grown_page, split};
use crate::config::HeapConfig;
use crate::errno::{EINVAL, set_errno};
use crate::error::{InvalidPointer, MallocError};

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parse from string (case-insensitive). `None` for unknown names.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" | "err" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `realloc`, `init`).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `heap_grow`, ...).
    pub event: &'static str,
    /// Payload offset involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Free-list class touched by the event.
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: live allocation count.
    pub active_count: usize,
    /// Snapshot: bytes held by allocated blocks, tags included.
    pub allocated_bytes: usize,
    /// Snapshot: blocks on the free lists.
    pub free_blocks: usize,
    /// Snapshot: committed heap size.
    pub heap_bytes: usize,
}

/// Whether the heap has been laid out yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeapPhase {
    #[default]
    Uninitialized,
    Ready,
}

/// Allocator state: heap, free lists and bookkeeping.
///
/// Single-threaded by construction (`&mut self` everywhere); share it across
/// threads only behind an external lock.
pub struct MallocState<H: HeapProvider = ArenaHeap> {
    heap: H,
    lists: FreeLists,
    phase: HeapPhase,
    config: HeapConfig,
    /// Monotonic lifecycle decision id.
    next_decision_id: u64,
    /// Structured allocator lifecycle records, oldest first.
    lifecycle_logs: VecDeque<AllocatorLogRecord>,
    active_count: usize,
    allocated_bytes: usize,
}

impl MallocState<ArenaHeap> {
    /// Allocator over a default arena.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Allocator over an arena sized by `config`.
    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_heap(ArenaHeap::new(config.max_pages), config)
    }

    /// Allocator configured from `SEGFIT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(HeapConfig::from_env())
    }
}

impl Default for MallocState<ArenaHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HeapProvider> MallocState<H> {
    /// Allocator over a caller-supplied heap provider.
    pub fn with_heap(heap: H, config: HeapConfig) -> Self {
        Self {
            heap,
            lists: FreeLists::new(),
            phase: HeapPhase::Uninitialized,
            config,
            next_decision_id: 1,
            lifecycle_logs: VecDeque::new(),
            active_count: 0,
            allocated_bytes: 0,
        }
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn record_lifecycle(
        &mut self,
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        ptr: Option<usize>,
        size: Option<usize>,
        class: Option<usize>,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        if self.config.log_capacity == 0 || level < self.config.log_level {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("core::malloc::{}::{:016x}", symbol, decision_id);
        if self.lifecycle_logs.len() >= self.config.log_capacity {
            self.lifecycle_logs.pop_front();
        }
        self.lifecycle_logs.push_back(AllocatorLogRecord {
            decision_id,
            trace_id,
            level,
            symbol,
            event,
            ptr,
            size,
            class,
            outcome,
            details: details.into(),
            active_count: self.active_count,
            allocated_bytes: self.allocated_bytes,
            free_blocks: self.lists.total_len(),
            heap_bytes: self.heap.end() - self.heap.start(),
        });
    }

    fn record_heap_stats(&mut self, symbol: &'static str) {
        let per_class: Vec<String> = (0..NUM_FREE_LISTS)
            .map(|class| self.lists.len(class).to_string())
            .collect();
        let wilderness = self
            .lists
            .wilderness()
            .map_or(0, |block| block_size(&self.heap, block));
        self.record_lifecycle(
            AllocatorLogLevel::Debug,
            symbol,
            "heap_stats",
            None,
            None,
            None,
            "snapshot",
            format!(
                "lists=[{}];wilderness_size={}",
                per_class.join(","),
                wilderness
            ),
        );
    }

    /// Lays out the first page: padding, prologue, wilderness, epilogue.
    ///
    /// Idempotent once the heap is ready.
    pub fn init(&mut self) -> Result<(), MallocError> {
        if self.phase == HeapPhase::Ready {
            return Ok(());
        }
        self.lists.reset();
        let Some(page) = self.heap.grow() else {
            self.record_lifecycle(
                AllocatorLogLevel::Warn,
                "init",
                "heap_exhausted",
                None,
                None,
                None,
                "enomem",
                "no page for initial heap",
            );
            return Err(MallocError::OutOfMemory);
        };
        let page_size = self.heap.page_size();
        let end = self.heap.end();
        let wilderness = page + FIRST_BLOCK_OFFSET;
        let wilderness_size = page_size - PADDING - PROLOGUE_SIZE - EPILOGUE_SIZE;

        let mem = &mut self.heap;
        write_tags(mem, page + PROLOGUE_OFFSET, PROLOGUE_SIZE, true);
        write_tags(mem, wilderness, wilderness_size, false);
        write_epilogue(mem, end);
        self.lists.insert_front(wilderness, WILDERNESS_CLASS);
        self.phase = HeapPhase::Ready;

        self.record_lifecycle(
            AllocatorLogLevel::Info,
            "init",
            "heap_init",
            None,
            Some(wilderness_size),
            Some(WILDERNESS_CLASS),
            "ready",
            format!("page={page:#x};end={end:#x}"),
        );
        Ok(())
    }

    /// Allocates `size` payload bytes.
    ///
    /// `Ok(None)` for a zero-size request (errno untouched). On failure errno
    /// is set to `ENOMEM` and any pages already grown stay in the wilderness.
    pub fn malloc(&mut self, size: usize) -> Result<Option<usize>, MallocError> {
        if size == 0 {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "malloc",
                "zero_size_request",
                None,
                Some(0),
                None,
                "null",
                "",
            );
            return Ok(None);
        }

        match self.allocate(size) {
            Ok(block) => {
                let ptr = payload_of(block);
                let granted = block_size(&self.heap, block);
                self.record_lifecycle(
                    AllocatorLogLevel::Trace,
                    "malloc",
                    "alloc",
                    Some(ptr),
                    Some(size),
                    Some(class_for(granted)),
                    "success",
                    format!("block_size={granted}"),
                );
                Ok(Some(ptr))
            }
            Err(err) => {
                set_errno(err.errno());
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "allocation_failed",
                    None,
                    Some(size),
                    None,
                    "enomem",
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    fn allocate(&mut self, size: usize) -> Result<usize, MallocError> {
        self.init()?;
        let required = required_block_size(size).ok_or(MallocError::OutOfMemory)?;

        for class in class_for(required)..WILDERNESS_CLASS {
            if self.lists.is_empty(class) {
                continue;
            }
            let mem = &self.heap;
            let fit = self
                .lists
                .first_fit(class, required, |block| block_size(mem, block));
            if let Some(block) = fit {
                self.lists.remove(block, class);
                self.place(block, required, false);
                return Ok(block);
            }
        }

        let wilderness = self.ensure_wilderness(required)?;
        self.lists.remove(wilderness, WILDERNESS_CLASS);
        self.place(wilderness, required, true);
        Ok(wilderness)
    }

    /// Marks an unlisted free block allocated, splitting off any usable tail.
    fn place(&mut self, block: usize, required: usize, from_wilderness: bool) {
        let mem = &mut self.heap;
        let size = block_size(mem, block);
        if will_splinter(size, required) {
            set_allocated(mem, block, true);
            self.allocated_bytes += size;
        } else {
            let remainder = split(mem, block, required);
            set_allocated(mem, block, true);
            let class = if from_wilderness {
                WILDERNESS_CLASS
            } else {
                class_for(size - required)
            };
            self.lists.insert_front(remainder, class);
            self.allocated_bytes += required;
        }
        self.active_count += 1;
    }

    /// Grows the heap until the wilderness block holds `required` bytes.
    fn ensure_wilderness(&mut self, required: usize) -> Result<usize, MallocError> {
        loop {
            if let Some(wilderness) = self.lists.wilderness() {
                if block_size(&self.heap, wilderness) >= required {
                    return Ok(wilderness);
                }
            }
            let Some(page) = self.heap.grow() else {
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "malloc",
                    "heap_exhausted",
                    None,
                    Some(required),
                    Some(WILDERNESS_CLASS),
                    "enomem",
                    "growth provider refused another page",
                );
                self.record_heap_stats("malloc");
                return Err(MallocError::OutOfMemory);
            };
            self.absorb_page(page);
        }
    }

    /// Folds a freshly grown page into the wilderness and moves the epilogue.
    fn absorb_page(&mut self, page: usize) {
        let page_size = self.heap.page_size();
        let end = self.heap.end();
        let mem = &mut self.heap;
        let wilderness = match self.lists.wilderness() {
            Some(wilderness) => coalesce_with_grown_page(mem, wilderness, page_size),
            None => {
                // The old epilogue word becomes the new block's header.
                let block = page - EPILOGUE_SIZE;
                write_tags(mem, block, page_size, false);
                block
            }
        };
        write_epilogue(mem, end);
        self.lists.insert_front(wilderness, WILDERNESS_CLASS);
        let size = block_size(&self.heap, wilderness);
        self.record_lifecycle(
            AllocatorLogLevel::Info,
            "malloc",
            "heap_grow",
            None,
            Some(size),
            Some(WILDERNESS_CLASS),
            "grown",
            format!("page={page:#x};end={end:#x}"),
        );
    }

    /// Checks that `ptr` is the payload of a live block, returning the block.
    pub fn validate(&self, ptr: usize) -> Result<usize, InvalidPointer> {
        if ptr == 0 {
            return Err(InvalidPointer::Null);
        }
        if ptr % ALIGNMENT != 0 {
            return Err(InvalidPointer::Misaligned(ptr));
        }
        let block = block_of(ptr);
        if self.phase != HeapPhase::Ready {
            return Err(InvalidPointer::OutOfBounds(block));
        }
        let start = self.heap.start();
        let limit = self.heap.end() - EPILOGUE_SIZE;
        if block < start + FIRST_BLOCK_OFFSET || block + WORD_SIZE > limit {
            return Err(InvalidPointer::OutOfBounds(block));
        }
        let mem = &self.heap;
        let word = header(mem, block);
        let size = unpack_size(word);
        if size < MIN_BLOCK_SIZE {
            return Err(InvalidPointer::BelowMinimum(size));
        }
        if word & !ALLOCATED != size as u64 {
            return Err(InvalidPointer::NotMultiple(word as usize));
        }
        match block.checked_add(size) {
            Some(block_end) if block_end <= limit => {}
            _ => return Err(InvalidPointer::OutOfBounds(block)),
        }
        if read_word(mem, footer_offset(block, size)) != word {
            return Err(InvalidPointer::FooterMismatch(block));
        }
        if word & ALLOCATED == 0 {
            return Err(InvalidPointer::NotAllocated(block));
        }
        Ok(block)
    }

    /// Releases `ptr`. An invalid pointer terminates the process.
    pub fn free(&mut self, ptr: usize) {
        if self.try_free(ptr).is_err() {
            std::process::abort();
        }
    }

    /// Releases `ptr`, reporting an invalid pointer instead of aborting.
    ///
    /// The heap is left untouched when validation fails.
    pub fn try_free(&mut self, ptr: usize) -> Result<(), InvalidPointer> {
        let block = match self.validate(ptr) {
            Ok(block) => block,
            Err(reason) => {
                self.record_lifecycle(
                    AllocatorLogLevel::Error,
                    "free",
                    "invalid_free",
                    Some(ptr),
                    None,
                    None,
                    "abort",
                    reason.to_string(),
                );
                return Err(reason);
            }
        };
        let size = block_size(&self.heap, block);
        self.allocated_bytes -= size;
        self.active_count -= 1;
        let (merged, class) = self.release(block);
        let merged_size = block_size(&self.heap, merged);
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "free",
            "free",
            Some(ptr),
            Some(size),
            Some(class),
            if merged == block && merged_size == size {
                "released"
            } else {
                "coalesced"
            },
            format!("block={merged:#x};merged_size={merged_size}"),
        );
        Ok(())
    }

    /// Frees `block`, merges it with free neighbors and lists the result.
    ///
    /// Returns the surviving block and the class it was filed under.
    fn release(&mut self, block: usize) -> (usize, usize) {
        let start = self.heap.start();
        let epilogue = self.heap.end() - EPILOGUE_SIZE;
        let mem = &mut self.heap;
        set_allocated(mem, block, false);

        let mut merged = block;
        let mut joins_wilderness = false;

        let prev_size = unpack_size(read_word(mem, block - WORD_SIZE));
        let prev = block.saturating_sub(prev_size);
        if prev_size >= MIN_BLOCK_SIZE && prev >= start && !is_allocated(mem, prev) {
            let class = if self.lists.wilderness() == Some(prev) {
                joins_wilderness = true;
                WILDERNESS_CLASS
            } else {
                class_for(prev_size)
            };
            self.lists.remove(prev, class);
            merged = coalesce_blocks(mem, merged, prev);
        }

        let next = block + block_size(mem, block);
        if next < epilogue && !is_allocated(mem, next) {
            let class = if self.lists.wilderness() == Some(next) {
                joins_wilderness = true;
                WILDERNESS_CLASS
            } else {
                class_for(block_size(mem, next))
            };
            self.lists.remove(next, class);
            merged = coalesce_blocks(mem, merged, next);
        }

        let merged_size = block_size(mem, merged);
        let class = if joins_wilderness || merged + merged_size == epilogue {
            WILDERNESS_CLASS
        } else {
            class_for(merged_size)
        };
        self.lists.insert_front(merged, class);
        (merged, class)
    }

    /// Resizes the allocation at `ptr` to `new_size` payload bytes.
    ///
    /// An invalid `ptr` sets errno to `EINVAL`. `new_size == 0` frees `ptr`
    /// and returns `Ok(None)`. Growth moves the data to a fresh block; if that
    /// fails the original allocation is left as it was.
    pub fn realloc(&mut self, ptr: usize, new_size: usize) -> Result<Option<usize>, MallocError> {
        let block = match self.validate(ptr) {
            Ok(block) => block,
            Err(reason) => {
                set_errno(EINVAL);
                self.record_lifecycle(
                    AllocatorLogLevel::Warn,
                    "realloc",
                    "realloc_invalid_pointer",
                    Some(ptr),
                    Some(new_size),
                    None,
                    "einval",
                    reason.to_string(),
                );
                return Err(reason.into());
            }
        };

        let current = block_size(&self.heap, block);
        if new_size == 0 {
            self.allocated_bytes -= current;
            self.active_count -= 1;
            let (_, class) = self.release(block);
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_free",
                Some(ptr),
                Some(0),
                Some(class),
                "null",
                "",
            );
            return Ok(None);
        }

        let Some(required) = required_block_size(new_size) else {
            let err = MallocError::OutOfMemory;
            set_errno(err.errno());
            return Err(err);
        };

        if required == current {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_same_size",
                Some(ptr),
                Some(new_size),
                Some(class_for(current)),
                "in_place",
                "",
            );
            return Ok(Some(ptr));
        }

        if required > current {
            let Some(moved) = self.malloc(new_size)? else {
                return Ok(None);
            };
            let len = new_size.min(current - TAG_OVERHEAD);
            self.heap.copy_within(ptr, moved, len);
            self.allocated_bytes -= current;
            self.active_count -= 1;
            self.release(block);
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_move",
                Some(moved),
                Some(new_size),
                Some(class_for(required)),
                "moved",
                format!("from={ptr:#x};copied={len}"),
            );
            return Ok(Some(moved));
        }

        if will_splinter(current, required) {
            self.record_lifecycle(
                AllocatorLogLevel::Trace,
                "realloc",
                "realloc_shrink_splinter",
                Some(ptr),
                Some(new_size),
                Some(class_for(current)),
                "in_place",
                format!("kept_size={current}"),
            );
            return Ok(Some(ptr));
        }

        let remainder = split(&mut self.heap, block, required);
        self.allocated_bytes -= current - required;
        let (merged, class) = self.release(remainder);
        self.record_lifecycle(
            AllocatorLogLevel::Trace,
            "realloc",
            "realloc_shrink",
            Some(ptr),
            Some(new_size),
            Some(class),
            "split",
            format!("remainder={remainder:#x};merged={merged:#x}"),
        );
        Ok(Some(ptr))
    }

    /// Current heap phase.
    #[must_use]
    pub const fn phase(&self) -> HeapPhase {
        self.phase
    }

    /// Whether `init` has laid out the heap.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.phase == HeapPhase::Ready
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of live allocations.
    #[must_use]
    pub const fn active_count(&self) -> usize {
        self.active_count
    }

    /// Bytes held by allocated blocks, tags included.
    #[must_use]
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// The underlying heap provider.
    #[must_use]
    pub const fn heap(&self) -> &H {
        &self.heap
    }

    /// The free lists.
    #[must_use]
    pub const fn free_lists(&self) -> &FreeLists {
        &self.lists
    }

    #[cfg(test)]
    pub(crate) fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Offset of the first heap byte.
    #[must_use]
    pub fn heap_start(&self) -> usize {
        self.heap.start()
    }

    /// Offset one past the last heap byte.
    #[must_use]
    pub fn heap_end(&self) -> usize {
        self.heap.end()
    }

    /// Members of free list `class`, head first, as block offsets.
    #[must_use]
    pub fn free_list_blocks(&self, class: usize) -> Vec<usize> {
        self.lists.iter(class).collect()
    }

    /// Number of members of free list `class`.
    #[must_use]
    pub fn free_list_len(&self, class: usize) -> usize {
        self.lists.len(class)
    }

    /// Blocks on any free list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        (0..NUM_FREE_LISTS).map(|class| self.lists.len(class)).sum()
    }

    /// Blocks on any free list whose size is exactly `size`.
    #[must_use]
    pub fn free_block_count_of_size(&self, size: usize) -> usize {
        let mem = &self.heap;
        (0..NUM_FREE_LISTS)
            .flat_map(|class| self.lists.iter(class))
            .filter(|&block| block_size(mem, block) == size)
            .count()
    }

    /// Size of the block owning payload `ptr`, if `ptr` is a live allocation.
    #[must_use]
    pub fn block_size(&self, ptr: usize) -> Option<usize> {
        let block = self.validate(ptr).ok()?;
        Some(block_size(&self.heap, block))
    }

    /// Whether `ptr` is the payload of a live allocation.
    #[must_use]
    pub fn is_allocated(&self, ptr: usize) -> bool {
        self.validate(ptr).is_ok()
    }

    /// Usable payload bytes of the live allocation at `ptr`.
    #[must_use]
    pub fn payload(&self, ptr: usize) -> Option<&[u8]> {
        let block = self.validate(ptr).ok()?;
        let size = block_size(&self.heap, block);
        Some(self.heap.slice(ptr, size - TAG_OVERHEAD))
    }

    /// Mutable usable payload bytes of the live allocation at `ptr`.
    pub fn payload_mut(&mut self, ptr: usize) -> Option<&mut [u8]> {
        let block = self.validate(ptr).ok()?;
        let size = block_size(&self.heap, block);
        Some(self.heap.slice_mut(ptr, size - TAG_OVERHEAD))
    }

    /// Returns a view of allocator lifecycle log records, oldest first.
    pub fn lifecycle_logs(&self) -> impl ExactSizeIterator<Item = &AllocatorLogRecord> + '_ {
        self.lifecycle_logs.iter()
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.lifecycle_logs.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::{ENOMEM, get_errno};
    use crate::malloc::layout::{PAGE_SIZE, TagMemory};

    fn small_heap(pages: usize) -> MallocState {
        MallocState::with_config(HeapConfig::default().with_max_pages(pages))
    }

    #[test]
    fn test_new_state_is_lazy() {
        let state = MallocState::new();
        assert_eq!(state.phase(), HeapPhase::Uninitialized);
        assert_eq!(state.heap_end(), state.heap_start());
        assert_eq!(state.active_count(), 0);
    }

    #[test]
    fn test_init_lays_out_first_page() {
        let mut state = MallocState::new();
        state.init().unwrap();
        state.init().unwrap();
        assert!(state.is_initialized());
        assert_eq!(state.heap_end(), PAGE_SIZE);
        assert_eq!(state.free_list_blocks(WILDERNESS_CLASS), vec![FIRST_BLOCK_OFFSET]);
        assert_eq!(state.free_block_count_of_size(1984), 1);
        let mem = state.heap();
        assert_eq!(header(mem, PROLOGUE_OFFSET), 32 | ALLOCATED);
        assert_eq!(read_word(mem, PAGE_SIZE - 8), ALLOCATED);
    }

    #[test]
    fn test_malloc_basic() {
        let mut state = MallocState::new();
        let ptr = state.malloc(100).unwrap().unwrap();
        assert_eq!(ptr % ALIGNMENT, 0);
        assert_eq!(state.block_size(ptr), Some(128));
        assert!(state.is_allocated(ptr));
        assert_eq!(state.active_count(), 1);
        assert_eq!(state.allocated_bytes(), 128);
    }

    #[test]
    fn test_malloc_zero_leaves_errno_alone() {
        let mut state = MallocState::new();
        set_errno(99);
        assert_eq!(state.malloc(0), Ok(None));
        assert_eq!(get_errno(), 99, "zero-size request must not write errno");
        assert!(!state.is_initialized(), "zero-size request must not init");

        let ptr = state.malloc(8).unwrap().unwrap();
        assert_eq!(state.realloc(ptr, 0), Ok(None));
        assert_eq!(get_errno(), 99, "realloc to zero must not write errno");
        set_errno(0);
    }

    #[test]
    fn test_malloc_overflowing_request_is_enomem() {
        let mut state = MallocState::new();
        set_errno(0);
        assert_eq!(state.malloc(usize::MAX), Err(MallocError::OutOfMemory));
        assert_eq!(get_errno(), ENOMEM);
        set_errno(0);
    }

    #[test]
    fn test_init_failure_is_enomem() {
        struct NoPages;
        impl TagMemory for NoPages {
            fn load_word(&self, _offset: usize) -> u64 {
                unreachable!("no page was ever committed")
            }
            fn store_word(&mut self, _offset: usize, _word: u64) {
                unreachable!("no page was ever committed")
            }
        }
        impl HeapProvider for NoPages {
            fn grow(&mut self) -> Option<usize> {
                None
            }
            fn start(&self) -> usize {
                0
            }
            fn end(&self) -> usize {
                0
            }
            fn slice(&self, _offset: usize, _len: usize) -> &[u8] {
                &[]
            }
            fn slice_mut(&mut self, _offset: usize, _len: usize) -> &mut [u8] {
                &mut []
            }
            fn copy_within(&mut self, _src: usize, _dst: usize, _len: usize) {}
        }

        let mut state = MallocState::with_heap(NoPages, HeapConfig::default());
        set_errno(0);
        assert_eq!(state.malloc(8), Err(MallocError::OutOfMemory));
        assert_eq!(get_errno(), ENOMEM);
        assert_eq!(state.phase(), HeapPhase::Uninitialized);
        set_errno(0);
    }

    #[test]
    fn test_free_reuses_block() {
        let mut state = MallocState::new();
        let a = state.malloc(64).unwrap().unwrap();
        let _guard = state.malloc(8).unwrap().unwrap();
        state.free(a);
        assert_eq!(state.active_count(), 1);
        let b = state.malloc(64).unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(state.heap_end(), PAGE_SIZE);
    }

    #[test]
    fn test_try_free_rejects_bad_pointers_without_mutation() {
        let mut state = MallocState::new();
        assert_eq!(state.try_free(0), Err(InvalidPointer::Null));
        assert_eq!(
            state.try_free(64),
            Err(InvalidPointer::OutOfBounds(56)),
            "nothing is valid before init"
        );

        let ptr = state.malloc(40).unwrap().unwrap();
        assert_eq!(state.try_free(ptr + 8), Err(InvalidPointer::Misaligned(ptr + 8)));
        assert_eq!(state.try_free(32), Err(InvalidPointer::OutOfBounds(24)));
        assert_eq!(
            state.try_free(PAGE_SIZE + 64),
            Err(InvalidPointer::OutOfBounds(PAGE_SIZE + 56))
        );
        state.try_free(ptr).unwrap();
        assert_eq!(
            state.try_free(ptr),
            Err(InvalidPointer::NotAllocated(block_of(ptr)))
        );
        assert_eq!(state.free_block_count(), 1);
        assert_eq!(state.free_block_count_of_size(1984), 1);
    }

    #[test]
    fn test_validate_detects_corrupted_tags() {
        let mut state = MallocState::new();
        let ptr = state.malloc(40).unwrap().unwrap();
        let block = block_of(ptr);

        state.heap.store_word(block, 64 | 0x4 | ALLOCATED);
        assert_eq!(
            state.validate(ptr),
            Err(InvalidPointer::NotMultiple(64 | 0x4 | 1))
        );

        state.heap.store_word(block, ALLOCATED);
        assert_eq!(state.validate(ptr), Err(InvalidPointer::BelowMinimum(0)));

        state.heap.store_word(block, 96 | ALLOCATED);
        assert_eq!(state.validate(ptr), Err(InvalidPointer::FooterMismatch(block)));
    }

    #[test]
    fn test_realloc_invalid_pointer_is_einval() {
        let mut state = MallocState::new();
        set_errno(0);
        let err = state.realloc(0, 10).unwrap_err();
        assert_eq!(err, MallocError::InvalidArgument(InvalidPointer::Null));
        assert_eq!(get_errno(), EINVAL);
        set_errno(0);
    }

    #[test]
    fn test_realloc_preserves_contents_when_moving() {
        let mut state = MallocState::new();
        let ptr = state.malloc(24).unwrap().unwrap();
        state.payload_mut(ptr).unwrap()[..24].copy_from_slice(&[7u8; 24]);
        let _fence = state.malloc(8).unwrap().unwrap();
        let moved = state.realloc(ptr, 300).unwrap().unwrap();
        assert_ne!(moved, ptr);
        assert_eq!(&state.payload(moved).unwrap()[..24], &[7u8; 24]);
        assert!(!state.is_allocated(ptr));
        assert_eq!(state.active_count(), 2);
    }

    #[test]
    fn test_realloc_growth_failure_keeps_original() {
        let mut state = small_heap(1);
        let ptr = state.malloc(100).unwrap().unwrap();
        state.payload_mut(ptr).unwrap()[0] = 0x5A;
        set_errno(0);
        assert_eq!(state.realloc(ptr, 4000), Err(MallocError::OutOfMemory));
        assert_eq!(get_errno(), ENOMEM);
        assert!(state.is_allocated(ptr));
        assert_eq!(state.payload(ptr).unwrap()[0], 0x5A);
        assert_eq!(state.active_count(), 1);
        set_errno(0);
    }

    #[test]
    fn test_exhaustion_keeps_grown_pages() {
        let mut state = small_heap(3);
        assert_eq!(state.malloc(PAGE_SIZE * 4), Err(MallocError::OutOfMemory));
        assert_eq!(state.heap_end(), 3 * PAGE_SIZE);
        assert_eq!(state.free_block_count(), 1);
        assert_eq!(state.free_block_count_of_size(1984 + 2 * PAGE_SIZE), 1);
    }

    #[test]
    fn test_growth_without_wilderness_reuses_old_epilogue() {
        let mut state = MallocState::new();
        // Consume the whole initial wilderness.
        let first = state.malloc(1984 - 16).unwrap().unwrap();
        assert!(state.free_lists().wilderness().is_none());
        let second = state.malloc(100).unwrap().unwrap();
        assert_eq!(block_of(second), PAGE_SIZE - EPILOGUE_SIZE);
        assert_eq!(state.heap_end(), 2 * PAGE_SIZE);
        assert_eq!(
            state.free_list_blocks(WILDERNESS_CLASS),
            vec![PAGE_SIZE - EPILOGUE_SIZE + 128]
        );
        assert_eq!(state.free_block_count_of_size(PAGE_SIZE - 128), 1);
        state.free(first);
        state.free(second);
        assert_eq!(state.free_block_count(), 1);
        assert_eq!(state.free_block_count_of_size(1984 + PAGE_SIZE), 1);
    }

    #[test]
    fn test_lifecycle_logs_include_trace_and_decision_ids() {
        let mut state = MallocState::new();
        let ptr = state.malloc(64).unwrap().unwrap();
        state.free(ptr);

        let logs = state.drain_lifecycle_logs();
        assert!(!logs.is_empty());
        assert!(logs.iter().all(|entry| entry.decision_id > 0));
        assert!(
            logs.iter()
                .all(|entry| entry.trace_id.starts_with("core::malloc::"))
        );
        assert!(
            logs.iter()
                .any(|entry| entry.level == AllocatorLogLevel::Trace && entry.symbol == "malloc")
        );
        assert!(
            logs.iter()
                .any(|entry| entry.level == AllocatorLogLevel::Info && entry.event == "heap_init")
        );
        assert_eq!(state.lifecycle_logs().len(), 0);
    }

    #[test]
    fn test_lifecycle_logs_warn_and_error_paths() {
        let mut state = small_heap(1);
        let ptr = state.malloc(16).unwrap().unwrap();
        let _ = state.try_free(ptr + 32);
        let _ = state.realloc(0xDEA0, 32);
        let _ = state.malloc(PAGE_SIZE);

        let logs = state.drain_lifecycle_logs();
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Error && entry.event == "invalid_free"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "realloc_invalid_pointer"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Warn && entry.event == "heap_exhausted"
        }));
        assert!(logs.iter().any(|entry| {
            entry.level == AllocatorLogLevel::Debug && entry.event == "heap_stats"
        }));
    }

    #[test]
    fn test_log_capacity_and_level_filter() {
        let config = HeapConfig {
            log_capacity: 4,
            log_level: AllocatorLogLevel::Trace,
            ..HeapConfig::default()
        };
        let mut state = MallocState::with_config(config);
        for _ in 0..10 {
            let ptr = state.malloc(8).unwrap().unwrap();
            state.free(ptr);
        }
        let logs = state.drain_lifecycle_logs();
        assert_eq!(logs.len(), 4);
        assert!(logs.windows(2).all(|w| w[0].decision_id < w[1].decision_id));

        let quiet = HeapConfig {
            log_level: AllocatorLogLevel::Warn,
            ..HeapConfig::default()
        };
        let mut state = MallocState::with_config(quiet);
        let ptr = state.malloc(8).unwrap().unwrap();
        state.free(ptr);
        assert_eq!(state.lifecycle_logs().len(), 0);
    }

    #[test]
    fn test_log_records_export_as_json() {
        let mut state = MallocState::new();
        let _ = state.malloc(8);
        let line = serde_json::to_string(&state.drain_lifecycle_logs()[0]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["symbol"], "init");
        assert_eq!(value["level"], "info");
        assert_eq!(value["event"], "heap_init");
    }

    #[test]
    fn test_parse_log_levels() {
        assert_eq!(
            AllocatorLogLevel::from_str_loose("TRACE"),
            Some(AllocatorLogLevel::Trace)
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose("warning"),
            Some(AllocatorLogLevel::Warn)
        );
        assert_eq!(
            AllocatorLogLevel::from_str_loose(" error "),
            Some(AllocatorLogLevel::Error)
        );
        assert_eq!(AllocatorLogLevel::from_str_loose("loud"), None);
        assert!(AllocatorLogLevel::Trace < AllocatorLogLevel::Error);
    }

    #[test]
    fn test_accounting_invariant_under_deterministic_trace() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let mut state = MallocState::new();
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;

        for _ in 0..1500 {
            let r = lcg(&mut rng);
            match r % 3 {
                0 => {
                    let size = ((r >> 8) as usize % 700).max(1);
                    if let Ok(Some(ptr)) = state.malloc(size) {
                        live.push((ptr, size));
                    }
                }
                1 if !live.is_empty() => {
                    let idx = (r as usize) % live.len();
                    let (ptr, _) = live.swap_remove(idx);
                    state.free(ptr);
                }
                2 if !live.is_empty() => {
                    let idx = (r as usize) % live.len();
                    let (ptr, _) = live[idx];
                    let new_size = ((r >> 16) as usize) % 700;
                    match state.realloc(ptr, new_size) {
                        Ok(None) => {
                            assert_eq!(new_size, 0);
                            live.swap_remove(idx);
                        }
                        Ok(Some(new_ptr)) => live[idx] = (new_ptr, new_size),
                        Err(err) => assert_eq!(err, MallocError::OutOfMemory),
                    }
                }
                _ => {}
            }

            let observed: usize = live
                .iter()
                .map(|&(ptr, size)| {
                    let block = state.block_size(ptr).expect("tracked pointer must stay live");
                    assert!(block - TAG_OVERHEAD >= size);
                    block
                })
                .sum();
            assert_eq!(state.active_count(), live.len());
            assert_eq!(state.allocated_bytes(), observed);
        }
    }
}
