//! Tor v3 onion address helpers.
//!
//! The algorithm (pubkey || truncated checksum || version, base32) is the
//! same one the hidden-service layer uses to compute its own address from
//! an Ed25519 key; it lives here because the wake protocol and the
//! direction tie-break (see `keychain`) both need to compute or validate
//! onion addresses without depending on the transport layer.

use sha3::{Digest, Sha3_256};
use thiserror::Error;

const ONION_VERSION: u8 = 0x03;
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

#[derive(Error, Debug)]
pub enum OnionError {
    #[error("invalid public key length")]
    InvalidKeyLength,
    #[error("malformed onion address")]
    Malformed,
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Derive the deterministic v3 onion address for an Ed25519 public key.
pub fn onion_address_from_pubkey(pubkey: &[u8; 32]) -> String {
    let mut onion_bytes = Vec::with_capacity(35);
    onion_bytes.extend_from_slice(pubkey);

    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey);
    hasher.update([ONION_VERSION]);
    let checksum = hasher.finalize();
    onion_bytes.extend_from_slice(&checksum[..2]);
    onion_bytes.push(ONION_VERSION);

    let encoded = base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &onion_bytes);
    format!("{encoded}.onion")
}

/// Parse and validate a v3 onion address string, returning the embedded public key.
pub fn pubkey_from_onion_address(address: &str) -> Result<[u8; 32], OnionError> {
    let stripped = address.strip_suffix(".onion").ok_or(OnionError::Malformed)?;
    let decoded = base32::decode(base32::Alphabet::Rfc4648Lower { padding: false }, stripped)
        .ok_or(OnionError::Malformed)?;
    if decoded.len() != 35 {
        return Err(OnionError::Malformed);
    }
    let (pubkey_bytes, rest) = decoded.split_at(32);
    let (checksum, version) = rest.split_at(2);
    if version != [ONION_VERSION] {
        return Err(OnionError::Malformed);
    }

    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(pubkey_bytes);
    hasher.update([ONION_VERSION]);
    let expected = hasher.finalize();
    if &expected[..2] != checksum {
        return Err(OnionError::ChecksumMismatch);
    }

    let mut pubkey = [0u8; 32];
    pubkey.copy_from_slice(pubkey_bytes);
    Ok(pubkey)
}
