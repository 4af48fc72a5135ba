//! Persistence: a single `rusqlite` connection owning the schema named in
//! the spec's external-interfaces section.
//!
//! The teacher's own `storage` module is an app-layer contract for
//! deniable/duress storage and never opens a database itself — this
//! module is new, but it keeps that contract's spirit: the core assumes
//! the handle it's given is already open and (if at-rest encryption is in
//! play) already decrypted. It never sees or manages the passphrase.

use rusqlite::Connection;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contact (
    id INTEGER PRIMARY KEY,
    display_name TEXT NOT NULL,
    onion_address TEXT NOT NULL UNIQUE,
    ed25519_pubkey BLOB NOT NULL,
    x25519_pubkey BLOB NOT NULL,
    kem_pubkey BLOB,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contact_key_chain (
    contact_id INTEGER PRIMARY KEY REFERENCES contact(id),
    root_key BLOB NOT NULL,
    sending_chain BLOB NOT NULL,
    receiving_chain BLOB NOT NULL,
    send_counter INTEGER NOT NULL DEFAULT 0,
    receive_counter INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_evolved_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ping_inbox (
    ping_id TEXT PRIMARY KEY,
    contact_id INTEGER NOT NULL REFERENCES contact(id),
    state INTEGER NOT NULL,
    first_seen_at INTEGER NOT NULL,
    last_updated_at INTEGER NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 1,
    ping_wire_bytes BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ping_inbox_contact_state ON ping_inbox(contact_id, state);
CREATE INDEX IF NOT EXISTS idx_ping_inbox_state ON ping_inbox(state);

CREATE TABLE IF NOT EXISTS outbox_message (
    message_id TEXT PRIMARY KEY,
    ping_id TEXT NOT NULL,
    ping_nonce BLOB NOT NULL,
    contact_id INTEGER NOT NULL REFERENCES contact(id),
    ciphertext BLOB NOT NULL,
    header_counter INTEGER NOT NULL,
    header_nonce BLOB NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_retry ON outbox_message(status, next_retry_at);

CREATE TABLE IF NOT EXISTS stored_message (
    message_id TEXT PRIMARY KEY,
    contact_id INTEGER NOT NULL REFERENCES contact(id),
    direction TEXT NOT NULL,
    message_type TEXT NOT NULL,
    payload BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    pinned INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_stored_message_contact_ts ON stored_message(contact_id, timestamp);

CREATE TABLE IF NOT EXISTS seen_nonce (
    sender_pubkey BLOB NOT NULL,
    nonce BLOB NOT NULL,
    seen_at INTEGER NOT NULL,
    PRIMARY KEY (sender_pubkey, nonce)
);
CREATE INDEX IF NOT EXISTS idx_seen_nonce_seen_at ON seen_nonce(seen_at);
"#;

pub struct Storage {
    pub conn: Connection,
}

impl Storage {
    /// Wrap an already-open connection (in-memory or on-disk) and apply
    /// the schema. Safe to call repeatedly; every statement is idempotent.
    pub fn open(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::open(Connection::open_in_memory()?)
    }

    pub fn open_path(path: &std::path::Path) -> rusqlite::Result<Self> {
        Self::open(Connection::open(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        storage.conn.execute_batch(SCHEMA).unwrap();
    }

    #[test]
    fn schema_creates_expected_tables() {
        let storage = Storage::open_in_memory().unwrap();
        let mut stmt = storage
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        for expected in [
            "contact",
            "contact_key_chain",
            "ping_inbox",
            "outbox_message",
            "stored_message",
            "seen_nonce",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }
}
