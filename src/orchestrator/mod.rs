//! Orchestrator: ties PingInbox + WakeProtocol + Transport +
//! DownloadScheduler + KeyChain + Storage into the receive and send
//! pipelines, and owns the event bus observers subscribe to.
//!
//! Per-contact serialisation (spec §5: "one serial task per contact for
//! all KeyChain and PingInbox mutations") is approximated here with a
//! `tokio::sync::Mutex` per contact id rather than a dedicated executor
//! per contact — the invariant (no two in-flight mutations interleave
//! for the same contact) holds either way; only the scheduling mechanism
//! differs from a true actor-per-contact runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use rusqlite::OptionalExtension;

use crate::config::Config;
use crate::contact::Contact;
use crate::crypto::signing;
use crate::download_scheduler::DownloadScheduler;
use crate::events::{CoreEvent, EventBus};
use crate::error::{CoreError, Result};
use crate::keychain::{self, ContactKeyChainState, SkipKeyStore};
use crate::outbox;
use crate::ping_inbox;
use crate::storage::Storage;
use crate::transport::listener::InboundFrame;
use crate::transport::Transport;
use crate::wire::{self, AckFrame, Frame, MessageFrame, PingFrame, PongFrame, ACK_MESSAGE, ACK_PING};

pub struct Identity {
    pub signing_key: ed25519_dalek::SigningKey,
    pub signing_pubkey: [u8; 32],
    pub x25519_priv: [u8; 32],
    pub x25519_pub: [u8; 32],
    pub onion_address: String,
}

pub struct Orchestrator {
    storage: tokio::sync::Mutex<Storage>,
    config: Config,
    events: EventBus,
    scheduler: DownloadScheduler,
    transport: Transport,
    identity: Identity,
    keychains: tokio::sync::Mutex<HashMap<i64, ContactKeyChainState>>,
    skip_store: SkipKeyStore,
    contact_locks: tokio::sync::Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    /// sender signing pubkey -> the listener connection that delivered their
    /// most recent PING, so a PONG/ACK can be replied on the same socket.
    listener_connections: tokio::sync::Mutex<HashMap<[u8; 32], u64>>,
}

impl Orchestrator {
    pub fn new(
        storage: Storage,
        config: Config,
        transport: Transport,
        identity: Identity,
    ) -> Self {
        let device_protection_enabled = config.device_protection_enabled;
        Self {
            storage: tokio::sync::Mutex::new(storage),
            config,
            events: EventBus::default(),
            scheduler: DownloadScheduler::new(device_protection_enabled),
            transport,
            identity,
            keychains: tokio::sync::Mutex::new(HashMap::new()),
            skip_store: SkipKeyStore::new(),
            contact_locks: tokio::sync::Mutex::new(HashMap::new()),
            listener_connections: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn contact_lock(&self, contact_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.contact_locks.lock().await;
        locks.entry(contact_id).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    fn load_contact(conn: &rusqlite::Connection, contact_id: i64) -> rusqlite::Result<Contact> {
        conn.query_row(
            "SELECT id, display_name, onion_address, ed25519_pubkey, x25519_pubkey, kem_pubkey, created_at
             FROM contact WHERE id = ?1",
            rusqlite::params![contact_id],
            |row| {
                let ed: Vec<u8> = row.get(3)?;
                let x25519: Vec<u8> = row.get(4)?;
                Ok(Contact {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    onion_address: row.get(2)?,
                    ed25519_pubkey: ed.try_into().unwrap_or([0u8; 32]),
                    x25519_pubkey: x25519.try_into().unwrap_or([0u8; 32]),
                    kem_pubkey: row.get(5)?,
                    created_at: row.get(6)?,
                })
            },
        )
    }

    async fn load_or_init_keychain(
        &self,
        conn: &rusqlite::Connection,
        contact: &Contact,
        now: i64,
    ) -> Result<ContactKeyChainState> {
        if let Some(state) = self.keychains.lock().await.get(&contact.id) {
            return Ok(state.clone());
        }

        let existing: Option<ContactKeyChainState> = conn
            .query_row(
                "SELECT root_key, sending_chain, receiving_chain, send_counter, receive_counter, created_at, last_evolved_at
                 FROM contact_key_chain WHERE contact_id = ?1",
                rusqlite::params![contact.id],
                |row| {
                    let root: Vec<u8> = row.get(0)?;
                    let sending: Vec<u8> = row.get(1)?;
                    let receiving: Vec<u8> = row.get(2)?;
                    Ok(ContactKeyChainState {
                        root_key: root.try_into().unwrap_or([0u8; 32]),
                        sending_chain: sending.try_into().unwrap_or([0u8; 32]),
                        receiving_chain: receiving.try_into().unwrap_or([0u8; 32]),
                        send_counter: row.get(3)?,
                        receive_counter: row.get(4)?,
                        created_at: row.get(5)?,
                        last_evolved_at: row.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::Storage)?;

        let state = match existing {
            Some(s) => s,
            None => {
                let state = keychain::init(
                    &self.identity.x25519_priv,
                    &contact.x25519_pubkey,
                    &self.identity.onion_address,
                    &contact.onion_address,
                    now,
                )?;
                persist_keychain(conn, contact.id, &state).map_err(CoreError::Storage)?;
                state
            }
        };
        self.keychains.lock().await.insert(contact.id, state.clone());
        Ok(state)
    }

    async fn store_keychain(&self, conn: &rusqlite::Connection, contact_id: i64, state: ContactKeyChainState) -> Result<()> {
        persist_keychain(conn, contact_id, &state).map_err(CoreError::Storage)?;
        self.keychains.lock().await.insert(contact_id, state);
        Ok(())
    }

    // ---- Inbound-from-UI surface (spec §6) ----

    /// Accept a contact (spec §4.2: "ContactKeyChain is created once on
    /// contact acceptance"). The `ContactKeyChain` itself is lazily
    /// derived on first `send`/receive via `load_or_init_keychain`, not
    /// here — this just makes the peer addressable.
    pub async fn add_contact(&self, contact: &Contact) -> Result<()> {
        let storage = self.storage.lock().await;
        storage
            .conn
            .execute(
                "INSERT INTO contact (id, display_name, onion_address, ed25519_pubkey, x25519_pubkey, kem_pubkey, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    contact.id,
                    contact.display_name,
                    contact.onion_address,
                    contact.ed25519_pubkey.to_vec(),
                    contact.x25519_pubkey.to_vec(),
                    contact.kem_pubkey,
                    contact.created_at,
                ],
            )
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    /// Encrypt, enqueue, and kick off delivery of a plaintext payload.
    pub async fn send(&self, contact_id: i64, plaintext: &[u8], now: i64) -> Result<String> {
        let lock = self.contact_lock(contact_id).await;
        let _guard = lock.lock().await;

        let message_id = {
            let mut bytes = [0u8; 16];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        };

        let storage = self.storage.lock().await;
        let contact = Self::load_contact(&storage.conn, contact_id).map_err(CoreError::Storage)?;
        let state = self.load_or_init_keychain(&storage.conn, &contact, now).await?;

        let (header, ciphertext, next_state) = keychain::encrypt_next(&state, plaintext)?;
        outbox::enqueue(&storage.conn, &message_id, contact_id, &ciphertext, header.counter, &header.nonce, now)
            .map_err(CoreError::Storage)?;
        self.store_keychain(&storage.conn, contact_id, next_state).await?;
        drop(storage);

        self.events.publish(CoreEvent::OutboxStatusChanged {
            message_id: message_id.clone(),
            status: outbox::STATUS_PENDING.to_string(),
        });
        Ok(message_id)
    }

    /// Drive one send attempt for an already-enqueued message: PING ->
    /// await PONG -> MESSAGE -> await ACK. Failures are recorded with
    /// backoff via `outbox::mark_failed`; this is meant to be called by a
    /// retry worker that polls `outbox::due_for_retry`.
    pub async fn drive_send(&self, message_id: &str, now: i64, port: u16) -> Result<()> {
        let (contact_id, ciphertext, header_counter, header_nonce, ping_id, nonce) = {
            let storage = self.storage.lock().await;
            let row = outbox::get(&storage.conn, message_id)
                .map_err(CoreError::Storage)?
                .ok_or(CoreError::Other(anyhow::anyhow!("unknown outbox message {message_id}")))?;
            let ping_id: [u8; 16] = hex::decode(&row.ping_id).ok().and_then(|v| v.try_into().ok()).unwrap_or([0u8; 16]);
            (row.contact_id, row.ciphertext, row.header_counter, row.header_nonce, ping_id, row.ping_nonce)
        };

        let contact = {
            let storage = self.storage.lock().await;
            Self::load_contact(&storage.conn, contact_id).map_err(CoreError::Storage)?
        };

        let ping = PingFrame::new(
            wire::CONTENT_TAG_VISIBLE,
            ping_id,
            self.identity.signing_pubkey,
            contact.ed25519_pubkey,
            now as u64,
            nonce,
            &self.identity.signing_key,
        );
        let ping_bytes = wire::encode_frame(&Frame::Ping(ping));

        let result = self
            .transport
            .send_ping(&contact.onion_address, port, &ping_bytes, now, Duration::from_millis(self.config.pong_deadline_ms))
            .await;

        let handle = match result {
            Ok(h) => h,
            Err(_) => {
                let storage = self.storage.lock().await;
                outbox::mark_failed(&storage.conn, message_id, now, &self.config).map_err(CoreError::Storage)?;
                return Ok(());
            }
        };

        {
            let storage = self.storage.lock().await;
            outbox::mark_ping_delivered(&storage.conn, message_id).map_err(CoreError::Storage)?;
        }

        // The recipient's handle_ping always replies with ACK_PING before
        // it ever has a PONG to send (download may not even be queued
        // yet), so the first frame back on this handle is that low-level
        // ack, not the PONG the send pipeline actually waits on.
        let ack_ping_wait = self
            .transport
            .recv_on_handle(&handle, Duration::from_millis(self.config.pong_deadline_ms))
            .await
            .and_then(|bytes| wire::decode_frame(&bytes).map_err(|_| crate::transport::TransportError::Socks5("malformed ping ack".into())));
        if !matches!(ack_ping_wait, Ok(Frame::Ack(ack)) if ack.kind == ACK_PING) {
            let storage = self.storage.lock().await;
            outbox::mark_failed(&storage.conn, message_id, now, &self.config).map_err(CoreError::Storage)?;
            return Ok(());
        }

        let pong_wait = self
            .transport
            .recv_on_handle(&handle, Duration::from_millis(self.config.pong_deadline_ms))
            .await
            .and_then(|bytes| wire::decode_frame(&bytes).map_err(|_| crate::transport::TransportError::Socks5("malformed pong".into())));

        let pong_ok = matches!(pong_wait, Ok(Frame::Pong(_)));
        if !pong_ok {
            let storage = self.storage.lock().await;
            outbox::mark_failed(&storage.conn, message_id, now, &self.config).map_err(CoreError::Storage)?;
            return Ok(());
        }

        let message_frame = MessageFrame {
            ping_id,
            header: keychain::MessageHeader { counter: header_counter, nonce: header_nonce },
            ciphertext: ciphertext.clone(),
        };
        let message_bytes = wire::encode_frame(&Frame::Message(message_frame));

        let send_result = self
            .transport
            .send_on_handle(&handle, &message_bytes, Duration::from_millis(self.config.msg_ack_deadline_ms))
            .await;

        if send_result.is_err() {
            let storage = self.storage.lock().await;
            outbox::mark_failed(&storage.conn, message_id, now, &self.config).map_err(CoreError::Storage)?;
            return Ok(());
        }

        let ack_wait = self
            .transport
            .recv_on_handle(&handle, Duration::from_millis(self.config.msg_ack_deadline_ms))
            .await
            .and_then(|bytes| wire::decode_frame(&bytes).map_err(|_| crate::transport::TransportError::Socks5("malformed ack".into())));

        match ack_wait {
            Ok(Frame::Ack(ack)) if ack.kind == ACK_MESSAGE => {
                let storage = self.storage.lock().await;
                outbox::mark_delivered(&storage.conn, message_id).map_err(CoreError::Storage)?;
                self.events.publish(CoreEvent::OutboxStatusChanged {
                    message_id: message_id.to_string(),
                    status: outbox::STATUS_DELIVERED.to_string(),
                });
            }
            _ => {
                let storage = self.storage.lock().await;
                outbox::mark_failed(&storage.conn, message_id, now, &self.config).map_err(CoreError::Storage)?;
            }
        }

        Ok(())
    }

    pub async fn request_download(&self, contact_id: i64, ping_id: &str, now: i64) -> Result<()> {
        let storage = self.storage.lock().await;
        let claimed = self
            .scheduler
            .on_user_lock_tapped(&storage.conn, contact_id, ping_id, now)
            .map_err(CoreError::Storage)?;
        let contact = Self::load_contact(&storage.conn, contact_id).map_err(CoreError::Storage)?;
        drop(storage);
        if !claimed {
            return Ok(());
        }

        let connection_id = self.listener_connections.lock().await.get(&contact.ed25519_pubkey).copied();
        let Some(connection_id) = connection_id else {
            let storage = self.storage.lock().await;
            ping_inbox::mark_failed_temp(&storage.conn, ping_id, now).map_err(CoreError::Storage)?;
            drop(storage);
            self.scheduler.on_download_failed_transient(contact_id, now, &self.config, &self.events);
            return Ok(());
        };

        self.run_download(contact_id, ping_id.to_string(), connection_id, now).await
    }

    /// Re-query a message's current status. Observers reload state off
    /// `OutboxStatusChanged` events rather than trusting the event's
    /// payload as an incremental delta; this is what they reload from.
    pub async fn outbox_status(&self, message_id: &str) -> Result<Option<String>> {
        let storage = self.storage.lock().await;
        Ok(outbox::get(&storage.conn, message_id).map_err(CoreError::Storage)?.map(|row| row.status))
    }

    pub async fn resend(&self, message_id: &str, now: i64) -> Result<()> {
        let storage = self.storage.lock().await;
        outbox::renew_for_resend(&storage.conn, message_id, now).map_err(CoreError::Storage)?;
        Ok(())
    }

    pub async fn delete_thread(&self, contact_id: i64) -> Result<()> {
        let storage = self.storage.lock().await;
        storage
            .conn
            .execute("DELETE FROM stored_message WHERE contact_id = ?1", rusqlite::params![contact_id])
            .map_err(CoreError::Storage)?;
        Ok(())
    }

    pub fn set_device_protection(&self, _enabled: bool) {
        // DownloadScheduler reads this at construction; a running toggle
        // would need interior mutability there. Left as an Open Question
        // resolution recorded in DESIGN.md: device protection is
        // currently fixed for the Orchestrator's lifetime.
    }

    /// Record which contact's thread the UI currently has open, so the
    /// device-protection gate in `handle_ping` knows whether to
    /// auto-download or leave a ping `MANUAL_REQUIRED`.
    pub fn set_foreground(&self, contact_id: Option<i64>) {
        self.scheduler.set_foreground(contact_id);
    }

    // ---- Receive pipeline ----

    pub async fn handle_inbound_frame(&self, frame: InboundFrame, now: i64) -> Result<()> {
        let decoded = match wire::decode_frame(&frame.payload) {
            Ok(f) => f,
            Err(_) => return Ok(()), // malformed: drop silently per §4.4 rule 5
        };

        match decoded {
            Frame::Ping(ping) => self.handle_ping(ping, frame.connection_id, now).await,
            Frame::Ack(ack) => self.handle_ack(ack).await,
            _ => Ok(()), // Pong/Message arrive only as replies on an open handle, not via listener dispatch
        }
    }

    async fn handle_ping(&self, ping: PingFrame, connection_id: u64, now: i64) -> Result<()> {
        if wire::validate_ping(&ping, now, self.config.replay_window_seconds).is_err() {
            return Ok(());
        }

        let storage = self.storage.lock().await;
        let contact_id: Option<i64> = storage
            .conn
            .query_row(
                "SELECT id FROM contact WHERE ed25519_pubkey = ?1",
                rusqlite::params![ping.sender_pubkey.to_vec()],
                |row| row.get(0),
            )
            .optional()
            .map_err(CoreError::Storage)?;
        let Some(contact_id) = contact_id else { return Ok(()) };

        let ping_id_str = hex::encode(ping.ping_id);
        let is_new = ping_inbox::record(&storage.conn, &ping_id_str, contact_id, &ping.to_bytes(), now)
            .map_err(CoreError::Storage)?;
        drop(storage);

        self.listener_connections.lock().await.insert(ping.sender_pubkey, connection_id);

        let ack = AckFrame { ping_id: ping.ping_id, kind: ACK_PING };
        let _ = self.transport.send_ack(connection_id, &wire::encode_frame(&Frame::Ack(ack))).await;

        if !is_new {
            return Ok(());
        }

        let silent = ping_inbox::is_silent(&ping.to_bytes());
        let should_download = self.scheduler.on_ping_arrived(contact_id, self.scheduler.is_foreground(contact_id));
        self.events.publish(CoreEvent::NewPing { contact_id });

        if should_download {
            let storage = self.storage.lock().await;
            let claimed = ping_inbox::claim_for_download(&storage.conn, &ping_id_str, now).map_err(CoreError::Storage)? > 0;
            drop(storage);
            if claimed {
                let _ = silent; // silent tag only suppresses UI rendering, not processing
                self.run_download(contact_id, ping_id_str, connection_id, now).await?;
            }
        } else {
            let storage = self.storage.lock().await;
            ping_inbox::mark_manual_required(&storage.conn, &ping_id_str, now).map_err(CoreError::Storage)?;
        }

        Ok(())
    }

    async fn run_download(&self, contact_id: i64, ping_id: String, connection_id: u64, now: i64) -> Result<()> {
        self.scheduler.on_download_started(contact_id);

        let ping_id_bytes: [u8; 16] = hex::decode(&ping_id).ok().and_then(|v| v.try_into().ok()).unwrap_or([0u8; 16]);
        let pong = PongFrame::new(ping_id_bytes, true, now as u64, &self.identity.signing_key);
        let pong_bytes = wire::encode_frame(&Frame::Pong(pong));

        let reply = self.transport.send_pong_listener(connection_id, &pong_bytes).await;
        let message_bytes = match reply {
            Ok(bytes) => bytes,
            Err(_) => {
                let storage = self.storage.lock().await;
                ping_inbox::mark_failed_temp(&storage.conn, &ping_id, now).map_err(CoreError::Storage)?;
                drop(storage);
                self.scheduler.on_download_failed_transient(contact_id, now, &self.config, &self.events);
                return Ok(());
            }
        };

        let message = match wire::decode_frame(&message_bytes) {
            Ok(Frame::Message(m)) => m,
            _ => {
                let storage = self.storage.lock().await;
                ping_inbox::mark_failed_temp(&storage.conn, &ping_id, now).map_err(CoreError::Storage)?;
                drop(storage);
                self.scheduler.on_download_failed_transient(contact_id, now, &self.config, &self.events);
                return Ok(());
            }
        };

        let storage = self.storage.lock().await;
        let contact = Self::load_contact(&storage.conn, contact_id).map_err(CoreError::Storage)?;
        let mut state = self.load_or_init_keychain(&storage.conn, &contact, now).await?;

        let plaintext = match keychain::decrypt_at(&mut state, &self.skip_store, contact_id, &message.header, &message.ciphertext, &self.config, now) {
            Ok(p) => p,
            Err(_) => {
                log::warn!("undecryptable message for ping {ping_id}, abandoning");
                drop(storage);
                self.scheduler.on_download_failed_transient(contact_id, now, &self.config, &self.events);
                return Ok(());
            }
        };

        let tx = storage.conn.unchecked_transaction().map_err(CoreError::Storage)?;
        let message_id = hex::encode(message.ping_id);
        tx.execute(
            "INSERT OR IGNORE INTO stored_message (message_id, contact_id, direction, message_type, payload, timestamp, read, pinned)
             VALUES (?1, ?2, 'inbound', 'text', ?3, ?4, 0, 0)",
            rusqlite::params![message_id, contact_id, plaintext, now],
        )
        .map_err(CoreError::Storage)?;
        ping_inbox::mark_msg_stored(&tx, &ping_id, now).map_err(CoreError::Storage)?;
        tx.commit().map_err(CoreError::Storage)?;
        self.store_keychain(&storage.conn, contact_id, state).await?;
        drop(storage);

        let ack = AckFrame { ping_id: ping_id_bytes, kind: ACK_MESSAGE };
        let _ = self.transport.send_ack(connection_id, &wire::encode_frame(&Frame::Ack(ack))).await;

        self.scheduler.on_download_succeeded(contact_id);
        self.events.publish(CoreEvent::MessageReceived { contact_id });
        Ok(())
    }

    async fn handle_ack(&self, ack: AckFrame) -> Result<()> {
        if ack.kind == ACK_MESSAGE {
            let ping_id = hex::encode(ack.ping_id);
            let storage = self.storage.lock().await;
            if let Some(row) = outbox::get_by_ping_id(&storage.conn, &ping_id).map_err(CoreError::Storage)? {
                outbox::mark_delivered(&storage.conn, &row.message_id).map_err(CoreError::Storage)?;
                self.events.publish(CoreEvent::OutboxStatusChanged {
                    message_id: row.message_id,
                    status: outbox::STATUS_DELIVERED.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn persist_keychain(conn: &rusqlite::Connection, contact_id: i64, state: &ContactKeyChainState) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO contact_key_chain (contact_id, root_key, sending_chain, receiving_chain, send_counter, receive_counter, created_at, last_evolved_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(contact_id) DO UPDATE SET
            sending_chain = excluded.sending_chain,
            receiving_chain = excluded.receiving_chain,
            send_counter = excluded.send_counter,
            receive_counter = excluded.receive_counter,
            last_evolved_at = excluded.last_evolved_at",
        rusqlite::params![
            contact_id,
            state.root_key.to_vec(),
            state.sending_chain.to_vec(),
            state.receiving_chain.to_vec(),
            state.send_counter,
            state.receive_counter,
            state.created_at,
            state.last_evolved_at,
        ],
    )?;
    Ok(())
}
