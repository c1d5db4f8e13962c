// Every extern "C" export takes raw pointers from C callers and validates
// them against the heap before use.
#![allow(clippy::missing_safety_doc)]
//! # segfit-abi
//!
//! `extern "C"` boundary for the segfit allocator.
//!
//! This crate produces a `cdylib` exposing `segfit_malloc`, `segfit_free`,
//! `segfit_realloc` and `segfit_errno`. Each entry point takes the global
//! allocator lock, translates between real pointers and heap offsets, and
//! delegates to the safe implementation in `segfit-core`, running over a
//! raw-memory heap ([`raw_heap::RawPageHeap`]) whose addresses stay valid for
//! C callers between calls.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> global lock -> core MallocState -> return
//! ```

pub mod errno_abi;
pub mod malloc_abi;
pub mod raw_heap;
