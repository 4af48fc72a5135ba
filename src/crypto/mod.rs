//! CryptoKernel: the only part of the crate that touches raw secret
//! material directly. Everything above this module works with opaque
//! key handles and persisted chain state.

pub mod constant_time;
pub mod encryption;
pub mod key_exchange;
#[cfg(feature = "pqc")]
pub mod pqc;
pub mod replay_cache;
pub mod signing;

pub use constant_time::{eq_24, eq_32, eq_64, eq_slices};
pub use encryption::{
    decrypt_message, decrypt_with_nonce_ad, derive_incoming_chain_key, derive_message_key,
    derive_outgoing_chain_key, derive_root_key, encrypt_message, encrypt_with_nonce_ad,
    evolve_chain_key, generate_key, EncryptionError, ROOT_KEY_INFO,
};
pub use key_exchange::{
    derive_public_key, derive_shared_secret, generate_static_keypair, KeyExchangeError,
};
pub use replay_cache::{check_ping_replay, compute_ping_hash};
pub use signing::{generate_signing_keypair, sign, verify, SigningError};
