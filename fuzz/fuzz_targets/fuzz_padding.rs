#![no_main]
use libfuzzer_sys::fuzz_target;
use onionpost::transport::padding;

fuzz_target!(|data: &[u8]| {
    if data.len() > padding::MAX_PADDED_PAYLOAD {
        return;
    }

    if let Ok(padded) = padding::pad_to_fixed_size(data) {
        assert_eq!(padded.len(), padding::FIXED_PACKET_SIZE);
        let stripped = padding::strip_padding(&padded).expect("valid padded frame must strip");
        assert_eq!(stripped, data);
    }

    // Arbitrary-length input must never panic, only fail.
    let _ = padding::strip_padding(data);
});
