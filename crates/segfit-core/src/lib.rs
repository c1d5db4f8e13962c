//! # segfit-core
//!
//! A segregated-fit dynamic memory allocator over an offset-addressed byte
//! arena. The heap, its boundary tags and its free lists are all managed in
//! safe Rust; no `unsafe` code is permitted at the crate level. Turning
//! offsets into real pointers is left to `segfit-abi`.

#![deny(unsafe_code)]

pub mod config;
pub mod errno;
pub mod error;
pub mod malloc;

pub use config::HeapConfig;
pub use error::{InvalidPointer, InvariantViolation, MallocError};
pub use malloc::MallocState;
