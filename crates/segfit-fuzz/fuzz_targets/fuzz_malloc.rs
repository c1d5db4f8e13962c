#![no_main]
use libfuzzer_sys::fuzz_target;
use segfit_core::{HeapConfig, MallocError, MallocState};

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one op: [kind, size_lo, size_hi, slot].
    if data.len() < 4 {
        return;
    }

    let mut state = MallocState::with_config(HeapConfig {
        log_capacity: 0,
        ..HeapConfig::default()
    });
    if state.init().is_err() {
        return;
    }
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 3;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let pick = chunk[3] as usize;

        match op {
            0 => match state.malloc(size) {
                Ok(Some(ptr)) => {
                    let fill = chunk[3];
                    if let Some(payload) = state.payload_mut(ptr) {
                        payload[..size].fill(fill);
                    }
                    live.push((ptr, size, fill));
                }
                Ok(None) => assert_eq!(size, 0),
                Err(err) => assert_eq!(err, MallocError::OutOfMemory),
            },
            1 => {
                if !live.is_empty() {
                    let (ptr, size, fill) = live.swap_remove(pick % live.len());
                    let intact = state
                        .payload(ptr)
                        .is_some_and(|payload| payload[..size].iter().all(|&b| b == fill));
                    assert!(intact, "payload clobbered at {ptr:#x}");
                    state.free(ptr);
                }
            }
            _ => {
                if !live.is_empty() {
                    let index = pick % live.len();
                    let (ptr, old_size, fill) = live[index];
                    let new_size = size % 4096;
                    match state.realloc(ptr, new_size) {
                        Ok(Some(moved)) => {
                            let keep = old_size.min(new_size);
                            let kept = state
                                .payload(moved)
                                .is_some_and(|p| p[..keep].iter().all(|&b| b == fill));
                            assert!(kept, "realloc lost data at {moved:#x}");
                            if let Some(payload) = state.payload_mut(moved) {
                                payload[..new_size].fill(fill);
                            }
                            live[index] = (moved, new_size, fill);
                        }
                        Ok(None) => {
                            assert_eq!(new_size, 0);
                            live.swap_remove(index);
                        }
                        Err(err) => assert_eq!(err, MallocError::OutOfMemory),
                    }
                }
            }
        }

        if let Err(violation) = state.verify() {
            panic!("heap invariant broken: {violation}");
        }
    }

    for (ptr, _, _) in live {
        state.free(ptr);
    }
    let stats = state.verify().unwrap_or_else(|v| panic!("heap invariant broken: {v}"));
    assert_eq!(stats.allocated_blocks, 0);
});
