//! `free` on a bad pointer must kill the process. Each case re-runs this test
//! binary filtered to itself with a marker variable set, and the parent checks
//! that the child died instead of returning.

use std::process::{Command, ExitStatus};

use segfit_core::MallocState;

const CHILD_ENV: &str = "SEGFIT_ABORT_CHILD";
#[cfg(unix)]
const SIGABRT: i32 = 6;

fn is_child(name: &str) -> bool {
    std::env::var(CHILD_ENV).as_deref() == Ok(name)
}

fn run_child(name: &str) -> ExitStatus {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([name, "--exact", "--test-threads=1", "--nocapture"])
        .env(CHILD_ENV, name)
        .output()
        .expect("spawn child test")
        .status
}

fn assert_aborted(status: ExitStatus) {
    assert!(!status.success(), "child returned normally: {status:?}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(SIGABRT), "child status {status:?}");
    }
}

#[test]
fn free_null_aborts() {
    if is_child("free_null_aborts") {
        let mut state = MallocState::new();
        let _ = state.malloc(8);
        state.free(0);
        return;
    }
    assert_aborted(run_child("free_null_aborts"));
}

#[test]
fn double_free_aborts() {
    if is_child("double_free_aborts") {
        let mut state = MallocState::new();
        let ptr = state.malloc(8).unwrap().unwrap();
        let _fence = state.malloc(8).unwrap().unwrap();
        state.free(ptr);
        state.free(ptr);
        return;
    }
    assert_aborted(run_child("double_free_aborts"));
}

#[test]
fn free_of_non_multiple_size_aborts() {
    if is_child("free_of_non_multiple_size_aborts") {
        let mut state = MallocState::new();
        let ptr = state.malloc(64).unwrap().unwrap();
        // Forge a header inside the payload whose flag bits are garbage.
        let forged = (64u64 | 0x4 | 0x1).to_ne_bytes();
        state.payload_mut(ptr).unwrap()[24..32].copy_from_slice(&forged);
        state.free(ptr + 32);
        return;
    }
    assert_aborted(run_child("free_of_non_multiple_size_aborts"));
}

#[test]
fn free_before_any_malloc_aborts() {
    if is_child("free_before_any_malloc_aborts") {
        let mut state = MallocState::new();
        state.free(64);
        return;
    }
    assert_aborted(run_child("free_before_any_malloc_aborts"));
}

#[test]
fn valid_free_does_not_abort() {
    if is_child("valid_free_does_not_abort") {
        let mut state = MallocState::new();
        let ptr = state.malloc(8).unwrap().unwrap();
        state.free(ptr);
        return;
    }
    assert!(run_child("valid_free_does_not_abort").success());
}
