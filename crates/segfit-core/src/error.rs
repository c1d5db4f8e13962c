//! Error types for allocator operations.

use thiserror::Error;

use crate::errno::{EINVAL, ENOMEM};

/// Why a payload pointer was rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidPointer {
    #[error("null pointer")]
    Null,
    #[error("payload offset {0:#x} is not 32-byte aligned")]
    Misaligned(usize),
    #[error("block at {0:#x} lies outside the heap")]
    OutOfBounds(usize),
    #[error("block size {0} is below the minimum block size")]
    BelowMinimum(usize),
    #[error("block header {0:#x} does not encode a multiple of 32")]
    NotMultiple(usize),
    #[error("footer of block at {0:#x} does not mirror its header")]
    FooterMismatch(usize),
    #[error("block at {0:#x} is not allocated")]
    NotAllocated(usize),
}

/// Failures reported by `malloc`/`realloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MallocError {
    /// The heap provider refused to grow before the request fit.
    #[error("out of memory: heap growth exhausted")]
    OutOfMemory,
    /// `realloc` was handed a pointer that failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] InvalidPointer),
}

impl MallocError {
    /// The errno value this error is reported as.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::InvalidArgument(_) => EINVAL,
        }
    }
}

/// A broken heap invariant found by [`crate::malloc::MallocState::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("heap is not initialized")]
    Uninitialized,
    #[error("prologue header/footer corrupted")]
    Prologue,
    #[error("epilogue at {0:#x} corrupted")]
    Epilogue(usize),
    #[error("block at {offset:#x} has invalid size {size}")]
    BadSize { offset: usize, size: usize },
    #[error("block at {0:#x} has a footer that does not mirror its header")]
    TagMismatch(usize),
    #[error("free blocks at {0:#x} and {1:#x} are adjacent")]
    Uncoalesced(usize, usize),
    #[error("free block at {0:#x} is not on any free list")]
    Unlisted(usize),
    #[error("block at {offset:#x} is listed in class {class} but belongs elsewhere")]
    WrongClass { offset: usize, class: usize },
    #[error("free list {class} links block at {offset:#x} which is not a free heap block")]
    StrayMember { offset: usize, class: usize },
    #[error("free list {0} has next/prev links that do not mirror")]
    BrokenLinks(usize),
    #[error("wilderness list holds {0} blocks")]
    WildernessOverfull(usize),
    #[error("wilderness block at {0:#x} does not abut the epilogue")]
    WildernessDetached(usize),
    #[error("blocks account for {accounted} bytes, expected {expected}")]
    Accounting { accounted: usize, expected: usize },
}
