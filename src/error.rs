//! Crate-wide error type. Individual modules define their own `thiserror`
//! enums; this type unions them for the Orchestrator's public API.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Crypto(#[from] crate::crypto::encryption::EncryptionError),

    #[error(transparent)]
    KeyExchange(#[from] crate::crypto::key_exchange::KeyExchangeError),

    #[error(transparent)]
    KeyChain(#[from] crate::keychain::KeyChainError),

    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error("contact {0} not found")]
    ContactNotFound(i64),

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
