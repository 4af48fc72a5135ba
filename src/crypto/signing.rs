//! Ed25519 signing helpers shared by the wake-protocol frame types.
//!
//! Grounded on the sign/verify pattern used throughout the wake-protocol
//! frames: sign over an explicit, manually-concatenated byte string (never
//! the bincode encoding of the struct itself), so the signed bytes are
//! stable regardless of how the wire format evolves.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("invalid signing key length")]
    InvalidKeyLength,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signature verification failed")]
    VerificationFailed,
}

pub type Result<T> = std::result::Result<T, SigningError>;

pub fn generate_signing_keypair() -> (SigningKey, [u8; 32]) {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying = signing_key.verifying_key().to_bytes();
    (signing_key, verifying)
}

pub fn sign(signing_key: &SigningKey, message: &[u8]) -> [u8; 64] {
    signing_key.sign(message).to_bytes()
}

pub fn verify(pubkey: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey).map_err(|_| SigningError::InvalidKeyLength)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| SigningError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let (key, pubkey) = generate_signing_keypair();
        let msg = b"ping frame bytes";
        let sig = sign(&key, msg);
        assert!(verify(&pubkey, msg, &sig).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let (key, pubkey) = generate_signing_keypair();
        let sig = sign(&key, b"original");
        assert!(verify(&pubkey, b"tampered", &sig).is_err());
    }
}
