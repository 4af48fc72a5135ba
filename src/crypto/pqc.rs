//! Optional hybrid post-quantum KEM bootstrap (ML-KEM-1024 / FIPS 203).
//!
//! Gated behind the `pqc` feature. When enabled, contact bootstrap can mix
//! an ML-KEM shared secret into the X25519 shared secret before it reaches
//! `derive_root_key`, producing the 64-byte combined secret that
//! `derive_root_key` already accepts. Disabled by default: the spec marks
//! this strictly optional and the 32-byte X25519-only path is the
//! supported default.

#![cfg(feature = "pqc")]

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem1024};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum PqcError {
    #[error("invalid encapsulation key")]
    InvalidKey,
    #[error("encapsulation failed")]
    EncapsulationFailed,
    #[error("decapsulation failed")]
    DecapsulationFailed,
}

pub type Result<T> = std::result::Result<T, PqcError>;

pub struct HybridKemKeypair {
    pub encapsulation_key_bytes: Vec<u8>,
    decapsulation_key: <MlKem1024 as KemCore>::DecapsulationKey,
}

impl Drop for HybridKemKeypair {
    fn drop(&mut self) {
        self.encapsulation_key_bytes.zeroize();
    }
}

/// Generate a fresh ML-KEM-1024 keypair for hybrid bootstrap.
pub fn generate_keypair() -> HybridKemKeypair {
    let (decapsulation_key, encapsulation_key) = MlKem1024::generate(&mut OsRng);
    HybridKemKeypair {
        encapsulation_key_bytes: encapsulation_key.as_bytes().to_vec(),
        decapsulation_key,
    }
}

/// Encapsulate against a peer's published encapsulation key.
/// Returns `(ciphertext_bytes, shared_secret_32_bytes)`.
pub fn encapsulate(their_encapsulation_key: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
    let ek = <MlKem1024 as KemCore>::EncapsulationKey::from_bytes(
        their_encapsulation_key
            .try_into()
            .map_err(|_| PqcError::InvalidKey)?,
    );
    let (ciphertext, shared_secret) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| PqcError::EncapsulationFailed)?;
    let mut ss = [0u8; 32];
    ss.copy_from_slice(&shared_secret);
    Ok((ciphertext.to_vec(), ss))
}

/// Decapsulate a ciphertext received against our own keypair.
pub fn decapsulate(keypair: &HybridKemKeypair, ciphertext: &[u8]) -> Result<[u8; 32]> {
    let ct = ciphertext.try_into().map_err(|_| PqcError::InvalidKey)?;
    let shared_secret = keypair
        .decapsulation_key
        .decapsulate(&ct)
        .map_err(|_| PqcError::DecapsulationFailed)?;
    let mut ss = [0u8; 32];
    ss.copy_from_slice(&shared_secret);
    Ok(ss)
}

/// Combine an X25519 shared secret with an ML-KEM shared secret into the
/// 64-byte input `derive_root_key` accepts for hybrid bootstrap.
pub fn combine_secrets(x25519_secret: &[u8; 32], kem_secret: &[u8; 32]) -> [u8; 64] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(x25519_secret);
    combined[32..].copy_from_slice(kem_secret);
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate_round_trip() {
        let keypair = generate_keypair();
        let (ciphertext, ss_sender) = encapsulate(&keypair.encapsulation_key_bytes).unwrap();
        let ss_receiver = decapsulate(&keypair, &ciphertext).unwrap();
        assert_eq!(ss_sender, ss_receiver);
    }

    #[test]
    fn combine_secrets_produces_64_bytes() {
        let combined = combine_secrets(&[1u8; 32], &[2u8; 32]);
        assert_eq!(combined.len(), 64);
        assert_eq!(&combined[..32], &[1u8; 32]);
        assert_eq!(&combined[32..], &[2u8; 32]);
    }
}
