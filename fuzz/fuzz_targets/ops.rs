#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segfit_fuzzing::Ops;

// Keep total live bytes well under anything that could slow the fuzzer
// down; the heap itself never shrinks within a run.
const ALLOCATION_LIMIT: u32 = 1 << 20;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Mix in libfuzzer's own byte-level mutations about 1/8 of the time so
    // the corpus does not ossify around what our mutator can reach.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(data).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);

    if session.mutate(&mut ops).is_ok() {
        // Re-encode into `data`, dropping trailing ops until the sequence
        // fits the buffer libfuzzer gave us.
        loop {
            if let Ok(new_size) = bincode::encode_into_slice(&ops, data, bincode_config()) {
                return new_size;
            }
            if !ops.pop() {
                break;
            }
        }
    }

    // Mutation or re-encoding failed; let libfuzzer have it.
    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Some(ops) = decode(data) {
        if let Err(e) = ops.run(ALLOCATION_LIMIT) {
            panic!("error: {e}");
        }
    }
});
