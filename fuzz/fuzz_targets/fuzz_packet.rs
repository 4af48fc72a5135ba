#![no_main]
use libfuzzer_sys::fuzz_target;
use onionpost::wire;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode cleanly to an error, never panic.
    let _ = wire::decode_frame(data);
});
