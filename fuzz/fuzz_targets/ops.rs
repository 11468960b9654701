#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segfit_fuzzing::Case;

/// Capacity of each case's heap source.
const HEAP_LIMIT: usize = 1 << 20;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Case> {
    bincode::decode_from_slice::<Case, _>(data, bincode_config())
        .ok()
        .map(|(case, _)| case)
}

/// Encode `case` into `data`, dropping trailing ops until it fits.
fn encode(mut case: Case, data: &mut [u8]) -> Option<usize> {
    loop {
        if let Ok(len) = bincode::encode_into_slice(&case, data, bincode_config()) {
            return Some(len);
        }
        if !case.pop() {
            return None;
        }
    }
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one mutation in eight to libFuzzer's byte-level mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut case = decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut case).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    encode(case, data).unwrap_or_else(|| fuzzer_mutate(data, size, max_size))
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(case) = decode(data) else {
        return;
    };
    if let Err(e) = case.run(HEAP_LIMIT) {
        panic!("{e}");
    }
});
