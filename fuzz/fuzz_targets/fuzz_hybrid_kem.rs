#![no_main]
#![cfg(feature = "pqc")]
use libfuzzer_sys::fuzz_target;
use onionpost::crypto::pqc;

fuzz_target!(|data: &[u8]| {
    let keypair = pqc::generate_keypair();

    if let Ok((ciphertext, shared_secret)) = pqc::encapsulate(&keypair.encapsulation_key_bytes) {
        let recovered = pqc::decapsulate(&keypair, &ciphertext)
            .expect("decapsulation of a ciphertext we just produced must succeed");
        assert_eq!(shared_secret, recovered);
    }

    // Arbitrary bytes as a supposed encapsulation key or ciphertext must
    // never panic, only fail.
    let _ = pqc::encapsulate(data);
    let _ = pqc::decapsulate(&keypair, data);
});
