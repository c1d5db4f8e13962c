//! ABI layer for `segfit_malloc`, `segfit_free` and `segfit_realloc`.
//!
//! One process-wide [`MallocState`] lives behind a `parking_lot::Mutex`; the
//! core allocator is single-threaded, so every entry point holds the lock for
//! the whole call. The heap is a [`RawPageHeap`] created on first use from
//! `SEGFIT_*` environment overrides.
//!
//! The core hands out heap offsets. They become real pointers by adding the
//! heap's base address, which never moves. Pointers outside the heap are
//! mapped to an offset that always fails validation.

use std::ffi::c_void;

use parking_lot::Mutex;
use segfit_core::errno::{EINVAL, ENOMEM, set_errno};
use segfit_core::malloc::{HeapStats, TAG_OVERHEAD};
use segfit_core::{HeapConfig, InvariantViolation, MallocState};

use crate::raw_heap::RawPageHeap;

type AbiState = MallocState<RawPageHeap>;

static STATE: Mutex<Option<AbiState>> = parking_lot::const_mutex(None);

/// Offset given to pointers that do not belong to the heap (misaligned on purpose).
const FOREIGN_OFFSET: usize = usize::MAX;

fn new_state() -> Option<AbiState> {
    let config = HeapConfig::from_env();
    let heap = RawPageHeap::new(config.max_pages)?;
    Some(MallocState::with_heap(heap, config))
}

/// Runs `f` on the global allocator, creating it first if needed.
///
/// `None` when the heap reservation itself could not be made.
fn with_state<R>(f: impl FnOnce(&mut AbiState) -> R) -> Option<R> {
    let mut guard = STATE.lock();
    if guard.is_none() {
        *guard = new_state();
    }
    guard.as_mut().map(f)
}

fn to_offset(state: &AbiState, ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let base = state.heap().base_ptr() as usize;
    match (ptr as usize).checked_sub(base) {
        Some(offset) if offset < state.heap_end() => offset,
        _ => FOREIGN_OFFSET,
    }
}

fn to_ptr(state: &AbiState, offset: usize) -> *mut c_void {
    state.heap().base_ptr().wrapping_add(offset).cast()
}

/// Allocates `size` bytes, 32-byte aligned.
///
/// Returns null for `size == 0` (errno untouched) or on exhaustion (errno
/// `ENOMEM`).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_malloc(size: usize) -> *mut c_void {
    let result = with_state(|state| match state.malloc(size) {
        Ok(Some(offset)) => to_ptr(state, offset),
        Ok(None) | Err(_) => std::ptr::null_mut(),
    });
    result.unwrap_or_else(|| {
        if size != 0 {
            set_errno(ENOMEM);
        }
        std::ptr::null_mut()
    })
}

/// Releases memory obtained from `segfit_malloc`/`segfit_realloc`.
///
/// Any other pointer, null included, aborts the process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_free(ptr: *mut c_void) {
    let freed = with_state(|state| {
        let offset = to_offset(state, ptr);
        state.free(offset);
    });
    if freed.is_none() {
        std::process::abort();
    }
}

/// Resizes the allocation at `ptr` to `size` bytes.
///
/// An invalid `ptr` (null included) returns null with errno `EINVAL`.
/// `size == 0` frees `ptr` and returns null. On exhaustion the original
/// allocation is untouched and errno is `ENOMEM`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let result = with_state(|state| {
        let offset = to_offset(state, ptr);
        match state.realloc(offset, size) {
            Ok(Some(moved)) => to_ptr(state, moved),
            Ok(None) | Err(_) => std::ptr::null_mut(),
        }
    });
    result.unwrap_or_else(|| {
        set_errno(EINVAL);
        std::ptr::null_mut()
    })
}

/// Runs the heap invariant checker over the global heap.
pub fn verify_heap() -> Result<HeapStats, InvariantViolation> {
    let guard = STATE.lock();
    match &*guard {
        Some(state) => state.verify(),
        None => Err(InvariantViolation::Uninitialized),
    }
}

/// Usable payload size of the live allocation at `ptr`, if any.
pub fn usable_size(ptr: *mut c_void) -> Option<usize> {
    with_state(|state| {
        let offset = to_offset(state, ptr);
        state.block_size(offset).map(|size| size - TAG_OVERHEAD)
    })
    .flatten()
}

/// Drops the global heap so the next call starts from an empty one.
///
/// # Safety
///
/// Every pointer previously returned by this module dangles afterwards; the
/// caller must guarantee none of them is used again.
#[doc(hidden)]
pub unsafe fn reset_heap_for_tests() {
    *STATE.lock() = None;
}
