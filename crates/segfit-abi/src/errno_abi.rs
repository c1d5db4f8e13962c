//! ABI layer for the allocator's error slot.
//!
//! The slot is the thread-local errno kept by `segfit-core`; it is only ever
//! written when an allocator call fails.

use std::ffi::c_int;

use segfit_core::errno;

/// Returns the calling thread's allocator errno.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_errno() -> c_int {
    errno::get_errno()
}

/// Overwrites the calling thread's allocator errno.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn segfit_set_errno(value: c_int) {
    errno::set_errno(value);
}
