//! Contact model (spec section 3).
//!
//! A stripped-down replacement for the teacher's wallet-aware `ContactCard`
//! (see the old `protocol::contact` module): only the fields the transport
//! core actually needs to address and authenticate a peer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub display_name: String,
    pub onion_address: String,
    pub ed25519_pubkey: [u8; 32],
    pub x25519_pubkey: [u8; 32],
    pub kem_pubkey: Option<Vec<u8>>,
    pub created_at: i64,
}

impl Contact {
    pub fn new(
        id: i64,
        display_name: impl Into<String>,
        onion_address: impl Into<String>,
        ed25519_pubkey: [u8; 32],
        x25519_pubkey: [u8; 32],
        created_at: i64,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            onion_address: onion_address.into(),
            ed25519_pubkey,
            x25519_pubkey,
            kem_pubkey: None,
            created_at,
        }
    }
}
