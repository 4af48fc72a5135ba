//! CryptoKernel primitives: AEAD encryption and the HKDF/HMAC key ladder.
//!
//! This module is the only place that touches raw key material. Callers
//! above it (principally `keychain`) own sequencing, counters and
//! persistence; everything here is a pure function of its inputs.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("invalid nonce length")]
    InvalidNonceLength,
}

pub type Result<T> = std::result::Result<T, EncryptionError>;

/// Encrypt with XChaCha20-Poly1305. Returns `nonce(24B) || ciphertext || tag(16B)`.
pub fn encrypt_message(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(EncryptionError::InvalidKeyLength);
    }
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(24 + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Inverse of [`encrypt_message`].
pub fn decrypt_message(encrypted_data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != 32 {
        return Err(EncryptionError::InvalidKeyLength);
    }
    if encrypted_data.len() < 24 + 16 {
        return Err(EncryptionError::DecryptionFailed);
    }
    let (nonce_bytes, ciphertext) = encrypted_data.split_at(24);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Encrypt with an explicit nonce and associated data, used by the wire
/// layer where the nonce is carried in the frame header rather than
/// prepended to the ciphertext.
pub fn encrypt_with_nonce_ad(
    plaintext: &[u8],
    key: &[u8; 32],
    nonce: &[u8; 24],
    ad: &[u8],
) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    let payload = chacha20poly1305::aead::Payload { msg: plaintext, aad: ad };
    cipher
        .encrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| EncryptionError::EncryptionFailed)
}

pub fn decrypt_with_nonce_ad(
    ciphertext: &[u8],
    key: &[u8; 32],
    nonce: &[u8; 24],
    ad: &[u8],
) -> Result<Vec<u8>> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    let payload = chacha20poly1305::aead::Payload { msg: ciphertext, aad: ad };
    cipher
        .decrypt(XNonce::from_slice(nonce), payload)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Generate a random 32-byte key.
pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Derive a root key from an X25519 (or hybrid X25519+KEM) shared secret via HKDF-SHA256.
/// `info` is a frozen wire-contract label; see `ROOT_KEY_INFO`.
pub fn derive_root_key(shared_secret: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    if shared_secret.len() != 32 && shared_secret.len() != 64 {
        return Err(EncryptionError::InvalidKeyLength);
    }
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut root_key = [0u8; 32];
    hkdf.expand(info, &mut root_key)
        .map_err(|_| EncryptionError::EncryptionFailed)?;
    Ok(root_key)
}

/// Frozen HKDF info label for root-key derivation. Must never change without a
/// wire migration: every peer pair must compute the same root key.
pub const ROOT_KEY_INFO: &[u8] = b"SecureLegion-RootKey-v1";

fn hmac_sha256(key: &[u8; 32], tag: u8) -> Result<[u8; 32]> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    mac.update(&[tag]);
    Ok(mac.finalize().into_bytes().into())
}

/// Evolve a chain key forward one step (one-way, provides forward secrecy).
pub fn evolve_chain_key(chain_key: &mut [u8; 32]) -> Result<[u8; 32]> {
    let next = hmac_sha256(chain_key, 0x01)?;
    chain_key.zeroize();
    Ok(next)
}

/// Derive the ephemeral message key for the current chain position.
pub fn derive_message_key(chain_key: &[u8; 32]) -> Result<[u8; 32]> {
    hmac_sha256(chain_key, 0x02)
}

/// Derive the "outgoing direction" chain key from a root key.
pub fn derive_outgoing_chain_key(root_key: &[u8; 32]) -> Result<[u8; 32]> {
    hmac_sha256(root_key, 0x03)
}

/// Derive the "incoming direction" chain key from a root key.
pub fn derive_incoming_chain_key(root_key: &[u8; 32]) -> Result<[u8; 32]> {
    hmac_sha256(root_key, 0x04)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = generate_key();
        let plaintext = b"hello onionpost";
        let encrypted = encrypt_message(plaintext, &key).unwrap();
        assert!(encrypted.len() > plaintext.len());
        let decrypted = decrypt_message(&encrypted, &key).unwrap();
        assert_eq!(plaintext, decrypted.as_slice());
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let key1 = generate_key();
        let key2 = generate_key();
        let encrypted = encrypt_message(b"secret", &key1).unwrap();
        assert!(decrypt_message(&encrypted, &key2).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = [0u8; 16];
        assert!(encrypt_message(b"test", &short_key).is_err());
    }

    #[test]
    fn chain_key_evolution_is_deterministic_and_one_way() {
        let seed = generate_key();
        let mut a = seed;
        let mut b = seed;
        let next_a = evolve_chain_key(&mut a).unwrap();
        let next_b = evolve_chain_key(&mut b).unwrap();
        assert_eq!(next_a, next_b);
        assert_ne!(next_a, seed);
    }

    #[test]
    fn direction_chain_keys_differ() {
        let root = generate_key();
        let out = derive_outgoing_chain_key(&root).unwrap();
        let inc = derive_incoming_chain_key(&root).unwrap();
        assert_ne!(out, inc);
    }

    #[test]
    fn root_key_derivation_accepts_32_and_64_byte_secrets() {
        let secret32 = [1u8; 32];
        let secret64 = [2u8; 64];
        assert!(derive_root_key(&secret32, ROOT_KEY_INFO).is_ok());
        assert!(derive_root_key(&secret64, ROOT_KEY_INFO).is_ok());
        assert!(derive_root_key(&[0u8; 10], ROOT_KEY_INFO).is_err());
    }
}
