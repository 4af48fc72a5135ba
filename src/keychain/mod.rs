//! KeyChain: per-contact forward-secret sending/receiving chains.
//!
//! Grounded on `crypto::encryption`'s HMAC chain-evolution primitives and
//! on the skip-key caching idiom the teacher's `ratchet.rs` uses for
//! out-of-order delivery (`skip_messages`/`try_skipped_keys`), but
//! deliberately does not carry over per-message DH/KEM ratcheting: this
//! chain is a single root-derived sending/receiving pair for the life of
//! the contact, matching the simpler contract this core actually needs.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::Config;
use crate::crypto::encryption::{
    decrypt_with_nonce_ad, derive_incoming_chain_key, derive_message_key,
    derive_outgoing_chain_key, derive_root_key, encrypt_with_nonce_ad, evolve_chain_key,
    EncryptionError, ROOT_KEY_INFO,
};
use crate::crypto::key_exchange::derive_shared_secret;

#[derive(Error, Debug)]
pub enum KeyChainError {
    #[error(transparent)]
    Crypto(#[from] EncryptionError),
    #[error("message undecryptable at this chain position")]
    Undecryptable,
    #[error("skip gap of {gap} exceeds skip window {window}")]
    TooManySkipped { gap: u64, window: usize },
    #[error("counter {received} is behind current position {current} and no cached key exists")]
    ReplayOrUnknown { received: u64, current: u64 },
}

pub type Result<T> = std::result::Result<T, KeyChainError>;

/// Forward-secret state for one contact. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct ContactKeyChainState {
    pub root_key: [u8; 32],
    pub sending_chain: [u8; 32],
    pub receiving_chain: [u8; 32],
    pub send_counter: u64,
    pub receive_counter: u64,
    #[zeroize(skip)]
    pub created_at: i64,
    #[zeroize(skip)]
    pub last_evolved_at: i64,
}

/// Header carried alongside each ciphertext; doubles as AEAD associated data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageHeader {
    pub counter: u64,
    pub nonce: [u8; 24],
}

impl MessageHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 24);
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out
    }
}

/// Initialise a fresh key chain for a newly-accepted contact.
///
/// Direction tie-break: the side with the lexicographically smaller
/// messaging onion address uses the root's "outgoing" derivation as its
/// sending chain; the other side uses "incoming". Both peers end up with
/// `peerA.sending_chain == peerB.receiving_chain` without an extra round trip.
pub fn init(
    our_x25519_priv: &[u8; 32],
    their_x25519_pub: &[u8; 32],
    our_onion: &str,
    their_onion: &str,
    now: i64,
) -> Result<ContactKeyChainState> {
    let shared = derive_shared_secret(our_x25519_priv, their_x25519_pub)
        .map_err(|_| EncryptionError::InvalidKeyLength)?;
    let root_key = derive_root_key(&shared, ROOT_KEY_INFO)?;
    let a = derive_outgoing_chain_key(&root_key)?;
    let b = derive_incoming_chain_key(&root_key)?;

    let (sending_chain, receiving_chain) = if our_onion < their_onion { (a, b) } else { (b, a) };

    Ok(ContactKeyChainState {
        root_key,
        sending_chain,
        receiving_chain,
        send_counter: 0,
        receive_counter: 0,
        created_at: now,
        last_evolved_at: now,
    })
}

/// Encrypt the next outbound message without mutating `state` in place.
///
/// Returns the header, ciphertext, and the chain state *after* this
/// message — the caller persists it in the same transaction as the
/// outbox row (see `Storage`), so a crash before that commit leaves the
/// old, still-usable chain state on disk rather than an advanced key
/// whose message was never durably queued.
pub fn encrypt_next(
    state: &ContactKeyChainState,
    plaintext: &[u8],
) -> Result<(MessageHeader, Vec<u8>, ContactKeyChainState)> {
    let msg_key = derive_message_key(&state.sending_chain)?;
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let header = MessageHeader { counter: state.send_counter, nonce };

    let ciphertext = encrypt_with_nonce_ad(plaintext, &msg_key, &nonce, &header.to_bytes())?;

    let mut evolved = state.sending_chain;
    let next_sending_chain = evolve_chain_key(&mut evolved)?;

    let next_state = ContactKeyChainState {
        root_key: state.root_key,
        sending_chain: next_sending_chain,
        receiving_chain: state.receiving_chain,
        send_counter: state.send_counter + 1,
        receive_counter: state.receive_counter,
        created_at: state.created_at,
        last_evolved_at: state.last_evolved_at,
    };

    Ok((header, ciphertext, next_state))
}

/// Decrypt an inbound message, evolving `state` in place and backfilling
/// the skip-key cache for any gap. See module docs for the three cases.
pub fn decrypt_at(
    state: &mut ContactKeyChainState,
    skip_store: &SkipKeyStore,
    contact_id: i64,
    header: &MessageHeader,
    ciphertext: &[u8],
    config: &Config,
    now: i64,
) -> Result<Vec<u8>> {
    let n = header.counter;
    let c = state.receive_counter;

    if n < c {
        let msg_key = skip_store
            .take(contact_id, n)
            .ok_or(KeyChainError::ReplayOrUnknown { received: n, current: c })?;
        return decrypt_with_nonce_ad(ciphertext, &msg_key, &header.nonce, &header.to_bytes())
            .map_err(|_| KeyChainError::Undecryptable);
    }

    if n == c {
        let msg_key = derive_message_key(&state.receiving_chain)?;
        let plaintext =
            decrypt_with_nonce_ad(ciphertext, &msg_key, &header.nonce, &header.to_bytes())
                .map_err(|_| KeyChainError::Undecryptable)?;
        let next = evolve_chain_key(&mut state.receiving_chain)?;
        state.receiving_chain = next;
        state.receive_counter = c + 1;
        state.last_evolved_at = now;
        return Ok(plaintext);
    }

    // n > c: derive and cache keys for c..n, then decrypt at n.
    let gap = n - c;
    if gap as usize > config.skip_window_size {
        return Err(KeyChainError::TooManySkipped { gap, window: config.skip_window_size });
    }

    let mut chain = state.receiving_chain;
    for idx in c..n {
        let msg_key = derive_message_key(&chain)?;
        skip_store.insert(contact_id, idx, msg_key, now, config.skip_window_size);
        chain = evolve_chain_key(&mut chain)?;
    }

    let msg_key = derive_message_key(&chain)?;
    let plaintext = decrypt_with_nonce_ad(ciphertext, &msg_key, &header.nonce, &header.to_bytes())
        .map_err(|_| KeyChainError::Undecryptable)?;
    let next = evolve_chain_key(&mut chain)?;

    state.receiving_chain = next;
    state.receive_counter = n + 1;
    state.last_evolved_at = now;

    Ok(plaintext)
}

/// Debug-only: reset both counters. Must be issued simultaneously on both
/// peers; not a core recovery path and never called from the send/receive
/// pipelines.
pub fn reset_counters(state: &mut ContactKeyChainState) {
    state.send_counter = 0;
    state.receive_counter = 0;
}

/// Bounded, TTL-swept cache of out-of-order message keys, keyed by
/// `(contact_id, counter)`. Capacity per contact is `skip_window_size`;
/// entries older than `skip_key_ttl_days` are dropped by `sweep_expired`.
#[derive(Default)]
pub struct SkipKeyStore {
    inner: Mutex<HashMap<(i64, u64), SkippedKey>>,
}

struct SkippedKey {
    key: [u8; 32],
    cached_at: i64,
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl SkipKeyStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn insert(&self, contact_id: i64, counter: u64, key: [u8; 32], now: i64, window: usize) {
        let mut map = self.inner.lock().unwrap();
        map.insert((contact_id, counter), SkippedKey { key, cached_at: now });

        // Bound the per-contact cache: if it exceeds the configured window,
        // evict the oldest entries for this contact.
        let mut this_contact: Vec<(u64, i64)> = map
            .iter()
            .filter(|((cid, _), _)| *cid == contact_id)
            .map(|((_, ctr), v)| (*ctr, v.cached_at))
            .collect();
        if this_contact.len() > window {
            this_contact.sort_by_key(|(_, cached_at)| *cached_at);
            let excess = this_contact.len() - window;
            for (ctr, _) in this_contact.into_iter().take(excess) {
                map.remove(&(contact_id, ctr));
            }
        }
    }

    fn take(&self, contact_id: i64, counter: u64) -> Option<[u8; 32]> {
        let mut map = self.inner.lock().unwrap();
        map.remove(&(contact_id, counter)).map(|k| k.key)
    }

    /// Drop any cached skip key older than `skip_key_ttl_days`.
    pub fn sweep_expired(&self, now: i64, ttl_days: i64) {
        let ttl_seconds = ttl_days.saturating_mul(86_400);
        let mut map = self.inner.lock().unwrap();
        map.retain(|_, v| now.saturating_sub(v.cached_at) < ttl_seconds);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_pair() -> (ContactKeyChainState, ContactKeyChainState) {
        let (a_pub, a_priv) = crate::crypto::key_exchange::generate_static_keypair();
        let (b_pub, b_priv) = crate::crypto::key_exchange::generate_static_keypair();
        let onion_a = "aaaa.onion";
        let onion_b = "bbbb.onion";
        let chain_a = init(&a_priv, &b_pub, onion_a, onion_b, 0).unwrap();
        let chain_b = init(&b_priv, &a_pub, onion_b, onion_a, 0).unwrap();
        (chain_a, chain_b)
    }

    #[test]
    fn direction_tie_break_produces_matching_chains() {
        let (chain_a, chain_b) = fixture_pair();
        assert_eq!(chain_a.sending_chain, chain_b.receiving_chain);
        assert_eq!(chain_b.sending_chain, chain_a.receiving_chain);
    }

    #[test]
    fn in_order_round_trip() {
        let (chain_a, mut chain_b) = fixture_pair();
        let config = Config::default();
        let skip_store = SkipKeyStore::new();

        let (header, ciphertext, chain_a_next) =
            encrypt_next(&chain_a, b"hello onionpost").unwrap();
        let plaintext =
            decrypt_at(&mut chain_b, &skip_store, 1, &header, &ciphertext, &config, 0).unwrap();

        assert_eq!(plaintext, b"hello onionpost");
        assert_eq!(chain_a_next.send_counter, 1);
        assert_eq!(chain_b.receive_counter, 1);
    }

    #[test]
    fn out_of_order_within_window_is_cached_and_decryptable() {
        let (chain_a, mut chain_b) = fixture_pair();
        let config = Config::default();
        let skip_store = SkipKeyStore::new();

        let mut sender_state = chain_a;
        let mut messages = Vec::new();
        for i in 0..3u8 {
            let (header, ciphertext, next) =
                encrypt_next(&sender_state, &[i]).unwrap();
            messages.push((header, ciphertext));
            sender_state = next;
        }

        // Deliver message index 2 before 0 and 1.
        let plaintext =
            decrypt_at(&mut chain_b, &skip_store, 7, &messages[2].0, &messages[2].1, &config, 0)
                .unwrap();
        assert_eq!(plaintext, vec![2u8]);
        assert_eq!(chain_b.receive_counter, 3);
        assert_eq!(skip_store.len(), 2);

        let plaintext0 =
            decrypt_at(&mut chain_b, &skip_store, 7, &messages[0].0, &messages[0].1, &config, 0)
                .unwrap();
        assert_eq!(plaintext0, vec![0u8]);

        let plaintext1 =
            decrypt_at(&mut chain_b, &skip_store, 7, &messages[1].0, &messages[1].1, &config, 0)
                .unwrap();
        assert_eq!(plaintext1, vec![1u8]);
        assert_eq!(skip_store.len(), 0);
    }

    #[test]
    fn gap_beyond_skip_window_is_rejected() {
        let (chain_a, mut chain_b) = fixture_pair();
        let mut config = Config::default();
        config.skip_window_size = 2;
        let skip_store = SkipKeyStore::new();

        let mut sender_state = chain_a;
        let mut last = None;
        for i in 0..5u8 {
            let (header, ciphertext, next) = encrypt_next(&sender_state, &[i]).unwrap();
            sender_state = next;
            last = Some((header, ciphertext));
        }
        let (header, ciphertext) = last.unwrap();
        let err = decrypt_at(&mut chain_b, &skip_store, 9, &header, &ciphertext, &config, 0)
            .unwrap_err();
        assert!(matches!(err, KeyChainError::TooManySkipped { .. }));
    }

    #[test]
    fn replayed_counter_without_cached_key_is_rejected() {
        let (chain_a, mut chain_b) = fixture_pair();
        let config = Config::default();
        let skip_store = SkipKeyStore::new();

        let (header, ciphertext, _) = encrypt_next(&chain_a, b"first").unwrap();
        decrypt_at(&mut chain_b, &skip_store, 3, &header, &ciphertext, &config, 0).unwrap();

        // Same header replayed: counter 0 is now behind current position 1,
        // and its one-shot skip key (never cached, since it was in-order) is gone.
        let err =
            decrypt_at(&mut chain_b, &skip_store, 3, &header, &ciphertext, &config, 0).unwrap_err();
        assert!(matches!(err, KeyChainError::ReplayOrUnknown { .. }));
    }

    #[test]
    fn sweep_expired_evicts_old_skip_keys() {
        let store = SkipKeyStore::new();
        store.insert(1, 0, [0u8; 32], 0, 1000);
        store.sweep_expired(31 * 86_400, 30);
        assert_eq!(store.len(), 0);
    }
}
