//! WakeProtocol wire frames: PING / PONG / MESSAGE / ACK.
//!
//! Grounded on the teacher's `network::pingpong` module: PING/PONG carry
//! an explicit `serialize_for_signing()` (a manual field concatenation)
//! rather than signing the bincode encoding of the struct, so the signed
//! bytes stay stable independent of how the on-disk/wire encoding evolves.
//! All multi-byte integers are big-endian per the wire contract.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::crypto::signing;
use crate::keychain::MessageHeader;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame too short")]
    Malformed,
    #[error("unknown frame type byte {0:#04x}")]
    UnknownFrameType(u8),
    #[error("timestamp outside the replay window")]
    TimestampOutOfWindow,
    #[error("nonce already seen (replay)")]
    Replay,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("sender is not a known contact")]
    UnknownSender,
    #[error(transparent)]
    Encoding(#[from] Box<bincode::ErrorKind>),
}

pub type Result<T> = std::result::Result<T, WireError>;

pub const ACK_PING: u8 = 1;
pub const ACK_MESSAGE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Ping = 0x01,
    Pong = 0x02,
    Message = 0x03,
    Ack = 0x04,
}

impl FrameType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x01 => Ok(FrameType::Ping),
            0x02 => Ok(FrameType::Pong),
            0x03 => Ok(FrameType::Message),
            0x04 => Ok(FrameType::Ack),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Unencrypted content-type tag carried by every PING so the receiver can
/// suppress UI side-effects (profile update / reaction) without having
/// downloaded or decrypted anything yet. Values other than the two silent
/// ones are treated as visible, including any value this crate doesn't
/// recognise yet — silence is opt-in, not opt-out.
pub const CONTENT_TAG_VISIBLE: u8 = 0x00;
pub const CONTENT_TAG_SILENT_PROFILE_UPDATE: u8 = 0x0F;
pub const CONTENT_TAG_SILENT_REACTION: u8 = 0x10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingFrame {
    pub content_tag: u8,
    pub ping_id: [u8; 16],
    pub sender_pubkey: [u8; 32],
    pub recipient_pubkey: [u8; 32],
    pub timestamp: u64,
    pub nonce: [u8; 24],
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl PingFrame {
    fn signing_bytes(
        content_tag: u8,
        ping_id: &[u8; 16],
        sender_pubkey: &[u8; 32],
        recipient_pubkey: &[u8; 32],
        timestamp: u64,
        nonce: &[u8; 24],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 16 + 32 + 32 + 8 + 24);
        buf.push(content_tag);
        buf.extend_from_slice(ping_id);
        buf.extend_from_slice(sender_pubkey);
        buf.extend_from_slice(recipient_pubkey);
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(nonce);
        buf
    }

    /// Build and sign a new PING. The (ping_id, nonce) pair is stable across
    /// retries of the same logical send so retransmits reuse the exact same
    /// ciphertext bytes rather than minting a fresh nonce each time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        content_tag: u8,
        ping_id: [u8; 16],
        sender_pubkey: [u8; 32],
        recipient_pubkey: [u8; 32],
        timestamp: u64,
        nonce: [u8; 24],
        signing_key: &ed25519_dalek::SigningKey,
    ) -> Self {
        let signing_bytes = Self::signing_bytes(
            content_tag,
            &ping_id,
            &sender_pubkey,
            &recipient_pubkey,
            timestamp,
            &nonce,
        );
        let signature = signing::sign(signing_key, &signing_bytes);
        Self { content_tag, ping_id, sender_pubkey, recipient_pubkey, timestamp, nonce, signature }
    }

    pub fn verify(&self) -> Result<()> {
        let signing_bytes = Self::signing_bytes(
            self.content_tag,
            &self.ping_id,
            &self.sender_pubkey,
            &self.recipient_pubkey,
            self.timestamp,
            &self.nonce,
        );
        signing::verify(&self.sender_pubkey, &signing_bytes, &self.signature)
            .map_err(|_| WireError::SignatureInvalid)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("PingFrame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongFrame {
    pub ping_id: [u8; 16],
    pub authenticated: bool,
    pub timestamp: u64,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl PongFrame {
    fn signing_bytes(ping_id: &[u8; 16], authenticated: bool, timestamp: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + 1 + 8);
        buf.extend_from_slice(ping_id);
        buf.push(authenticated as u8);
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf
    }

    pub fn new(
        ping_id: [u8; 16],
        authenticated: bool,
        timestamp: u64,
        signing_key: &ed25519_dalek::SigningKey,
    ) -> Self {
        let signing_bytes = Self::signing_bytes(&ping_id, authenticated, timestamp);
        let signature = signing::sign(signing_key, &signing_bytes);
        Self { ping_id, authenticated, timestamp, signature }
    }

    pub fn verify(&self, recipient_pubkey: &[u8; 32]) -> Result<()> {
        let signing_bytes = Self::signing_bytes(&self.ping_id, self.authenticated, self.timestamp);
        signing::verify(recipient_pubkey, &signing_bytes, &self.signature)
            .map_err(|_| WireError::SignatureInvalid)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("PongFrame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFrame {
    pub ping_id: [u8; 16],
    pub header: MessageHeader,
    pub ciphertext: Vec<u8>,
}

impl MessageFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("MessageFrame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckFrame {
    pub ping_id: [u8; 16],
    pub kind: u8,
}

impl AckFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("AckFrame serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Ping(PingFrame),
    Pong(PongFrame),
    Message(MessageFrame),
    Ack(AckFrame),
}

/// Prepend the 1-byte frame-type tag and encode.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let (tag, body) = match frame {
        Frame::Ping(f) => (FrameType::Ping as u8, f.to_bytes()),
        Frame::Pong(f) => (FrameType::Pong as u8, f.to_bytes()),
        Frame::Message(f) => (FrameType::Message as u8, f.to_bytes()),
        Frame::Ack(f) => (FrameType::Ack as u8, f.to_bytes()),
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(&body);
    out
}

/// Decode a tagged wire frame. Length and magic checks happen before any
/// crypto runs, per the validation ordering in the wake protocol.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() {
        return Err(WireError::Malformed);
    }
    let frame_type = FrameType::from_u8(bytes[0])?;
    let body = &bytes[1..];
    Ok(match frame_type {
        FrameType::Ping => Frame::Ping(PingFrame::from_bytes(body)?),
        FrameType::Pong => Frame::Pong(PongFrame::from_bytes(body)?),
        FrameType::Message => Frame::Message(MessageFrame::from_bytes(body)?),
        FrameType::Ack => Frame::Ack(AckFrame::from_bytes(body)?),
    })
}

/// Apply the five validation rules of the wake protocol to an inbound PING:
/// timestamp window, replay cache, and signature (length/magic checks
/// already happened in `decode_frame`). The sender-is-a-known-contact
/// check is the caller's responsibility since it needs the contact table.
pub fn validate_ping(ping: &PingFrame, now: i64, replay_window_seconds: i64) -> Result<()> {
    let age = now - ping.timestamp as i64;
    if age.abs() > replay_window_seconds {
        return Err(WireError::TimestampOutOfWindow);
    }
    if !crate::crypto::replay_cache::check_ping_replay(
        ping.sender_pubkey,
        crate::crypto::replay_cache::compute_ping_hash(&ping.to_bytes()),
    ) {
        return Err(WireError::Replay);
    }
    ping.verify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing::generate_signing_keypair;

    #[test]
    fn ping_sign_verify_round_trip() {
        let (key, pubkey) = generate_signing_keypair();
        let ping = PingFrame::new(CONTENT_TAG_VISIBLE, [1u8; 16], pubkey, [2u8; 32], 1000, [3u8; 24], &key);
        assert!(ping.verify().is_ok());
    }

    #[test]
    fn ping_wire_round_trip() {
        let (key, pubkey) = generate_signing_keypair();
        let ping = PingFrame::new(CONTENT_TAG_VISIBLE, [1u8; 16], pubkey, [2u8; 32], 1000, [3u8; 24], &key);
        let bytes = ping.to_bytes();
        let decoded = PingFrame::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.ping_id, ping.ping_id);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn pong_sign_verify_round_trip() {
        let (key, pubkey) = generate_signing_keypair();
        let pong = PongFrame::new([9u8; 16], true, 5000, &key);
        assert!(pong.verify(&pubkey).is_ok());
    }

    #[test]
    fn frame_dispatch_round_trip() {
        let (key, pubkey) = generate_signing_keypair();
        let ping = PingFrame::new(CONTENT_TAG_VISIBLE, [1u8; 16], pubkey, [2u8; 32], 1000, [3u8; 24], &key);
        let encoded = encode_frame(&Frame::Ping(ping));
        match decode_frame(&encoded).unwrap() {
            Frame::Ping(decoded) => assert!(decoded.verify().is_ok()),
            _ => panic!("expected a ping frame"),
        }
    }

    #[test]
    fn ack_frame_round_trip() {
        let ack = AckFrame { ping_id: [4u8; 16], kind: ACK_MESSAGE };
        let encoded = encode_frame(&Frame::Ack(ack));
        match decode_frame(&encoded).unwrap() {
            Frame::Ack(decoded) => assert_eq!(decoded.kind, ACK_MESSAGE),
            _ => panic!("expected an ack frame"),
        }
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let (key, pubkey) = generate_signing_keypair();
        let ping = PingFrame::new(CONTENT_TAG_VISIBLE, [5u8; 16], pubkey, [2u8; 32], 0, [6u8; 24], &key);
        let err = validate_ping(&ping, 10_000, 300).unwrap_err();
        assert!(matches!(err, WireError::TimestampOutOfWindow));
    }

    #[test]
    fn duplicate_ping_is_rejected_as_replay() {
        let (key, pubkey) = generate_signing_keypair();
        let ping = PingFrame::new(CONTENT_TAG_VISIBLE, [11u8; 16], pubkey, [2u8; 32], 1_000_000, [7u8; 24], &key);
        assert!(validate_ping(&ping, 1_000_000, 300).is_ok());
        let err = validate_ping(&ping, 1_000_000, 300).unwrap_err();
        assert!(matches!(err, WireError::Replay));
    }
}
