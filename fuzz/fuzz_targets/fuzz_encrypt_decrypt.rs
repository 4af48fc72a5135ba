#![no_main]
use libfuzzer_sys::fuzz_target;
use onionpost::crypto;

fuzz_target!(|data: &[u8]| {
    if data.len() < 33 {
        return;
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&data[..32]);
    let plaintext = &data[32..];

    if let Ok(ciphertext) = crypto::encryption::encrypt_message(plaintext, &key) {
        let decrypted = crypto::encryption::decrypt_message(&ciphertext, &key)
            .expect("decryption of freshly encrypted ciphertext must succeed");
        assert_eq!(decrypted, plaintext);
    }

    // Arbitrary bytes must never panic, only fail.
    let _ = crypto::encryption::decrypt_message(data, &key);
});
