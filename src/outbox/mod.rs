//! OutboxQueue: durable send queue with exponential backoff and full
//! jitter, grounded on the teacher's `network::pingpong` retry loop (same
//! backoff shape: `base * 2^attempts` capped, then jittered by ±25%)
//! adapted here to a schema-backed, crash-safe queue instead of an
//! in-memory retry timer.

use rand::{Rng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::Config;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SENDING: &str = "sending";
pub const STATUS_PING_DELIVERED: &str = "ping_delivered";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub message_id: String,
    pub ping_id: String,
    pub ping_nonce: [u8; 24],
    pub contact_id: i64,
    pub ciphertext: Vec<u8>,
    pub header_counter: u64,
    pub header_nonce: [u8; 24],
    pub status: String,
    pub attempts: i64,
    pub next_retry_at: i64,
    pub created_at: i64,
}

fn random_ping_id() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn random_ping_nonce() -> [u8; 24] {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Enqueue an already-encrypted message. `header_counter`/`header_nonce`
/// are the `MessageHeader` produced alongside `ciphertext` by
/// `keychain::encrypt_next`, persisted so a later `drive_send` attempt
/// (possibly after a process restart) resends the exact header the
/// recipient's ratchet advanced for, instead of a fresh placeholder.
///
/// The PING `ping_id`/`ping_nonce` pair is minted once here and then
/// belongs to this row for the rest of its life: every `drive_send`
/// retry reads it back and reuses it verbatim, so the receiver's
/// PingInbox (keyed on `ping_id`) absorbs duplicate attempts instead of
/// treating each as a new message. Only `renew_for_resend` mints a fresh
/// pair, for an explicit user-initiated resend.
pub fn enqueue(
    conn: &Connection,
    message_id: &str,
    contact_id: i64,
    ciphertext: &[u8],
    header_counter: u64,
    header_nonce: &[u8; 24],
    now: i64,
) -> rusqlite::Result<()> {
    let ping_id = hex::encode(random_ping_id());
    let ping_nonce = random_ping_nonce();
    conn.execute(
        "INSERT INTO outbox_message (message_id, ping_id, ping_nonce, contact_id, ciphertext, header_counter, header_nonce, status, attempts, next_retry_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        params![
            message_id,
            ping_id,
            ping_nonce.to_vec(),
            contact_id,
            ciphertext,
            header_counter as i64,
            header_nonce.to_vec(),
            STATUS_PENDING,
            now
        ],
    )?;
    Ok(())
}

/// Re-arm an already-enqueued message for a fresh delivery attempt: same
/// `message_id` and ciphertext, but a new `ping_id`/`ping_nonce` pair so
/// the recipient's PingInbox treats this as a new delivery rather than a
/// retransmit of one it may have already downloaded and given up on.
pub fn renew_for_resend(conn: &Connection, message_id: &str, now: i64) -> rusqlite::Result<usize> {
    let ping_id = hex::encode(random_ping_id());
    let ping_nonce = random_ping_nonce();
    conn.execute(
        "UPDATE outbox_message SET ping_id = ?2, ping_nonce = ?3, status = ?4, attempts = 0, next_retry_at = ?5 WHERE message_id = ?1",
        params![message_id, ping_id, ping_nonce.to_vec(), STATUS_PENDING, now],
    )
}

pub fn mark_sending(conn: &Connection, message_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE outbox_message SET status = ?2 WHERE message_id = ?1 AND status != ?3",
        params![message_id, STATUS_SENDING, STATUS_DELIVERED],
    )
}

pub fn mark_ping_delivered(conn: &Connection, message_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE outbox_message SET status = ?2 WHERE message_id = ?1",
        params![message_id, STATUS_PING_DELIVERED],
    )
}

pub fn mark_delivered(conn: &Connection, message_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE outbox_message SET status = ?2 WHERE message_id = ?1",
        params![message_id, STATUS_DELIVERED],
    )
}

/// Record a transient failure and reschedule with exponential backoff +
/// full jitter: `delay = random(0, min(cap, base * 2^attempts))`. Once
/// `attempts` reaches `config.send_max_attempts` the row is marked
/// permanently `failed` instead of rescheduled.
pub fn mark_failed(
    conn: &Connection,
    message_id: &str,
    now: i64,
    config: &Config,
) -> rusqlite::Result<()> {
    let attempts: i64 = conn.query_row(
        "SELECT attempts FROM outbox_message WHERE message_id = ?1",
        params![message_id],
        |row| row.get(0),
    )?;
    let attempts = attempts + 1;

    if attempts as u32 >= config.send_max_attempts {
        conn.execute(
            "UPDATE outbox_message SET status = ?2, attempts = ?3 WHERE message_id = ?1",
            params![message_id, STATUS_FAILED, attempts],
        )?;
        return Ok(());
    }

    let delay_ms = backoff_delay_ms(attempts as u32, config);
    conn.execute(
        "UPDATE outbox_message SET status = ?2, attempts = ?3, next_retry_at = ?4 WHERE message_id = ?1",
        params![message_id, STATUS_PENDING, attempts, now + delay_ms as i64 / 1000],
    )?;
    Ok(())
}

fn backoff_delay_ms(attempts: u32, config: &Config) -> u64 {
    let exp = config.send_backoff_base_ms.saturating_mul(1u64 << attempts.min(20));
    let capped = exp.min(config.send_backoff_cap_ms);
    let jitter_span = (capped as f64 * config.jitter_fraction) as i64;
    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-jitter_span..=jitter_span);
    (capped as i64 + jitter).max(0) as u64
}

/// Rows due for a retry attempt right now, oldest first.
pub fn due_for_retry(conn: &Connection, now: i64) -> rusqlite::Result<Vec<OutboxRow>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, ping_id, ping_nonce, contact_id, ciphertext, header_counter, header_nonce, status, attempts, next_retry_at, created_at
         FROM outbox_message
         WHERE status IN (?1, ?2) AND next_retry_at <= ?3
         ORDER BY next_retry_at ASC",
    )?;
    let rows = stmt
        .query_map(params![STATUS_PENDING, STATUS_PING_DELIVERED, now], row_to_outbox)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, message_id: &str) -> rusqlite::Result<Option<OutboxRow>> {
    conn.query_row(
        "SELECT message_id, ping_id, ping_nonce, contact_id, ciphertext, header_counter, header_nonce, status, attempts, next_retry_at, created_at
         FROM outbox_message WHERE message_id = ?1",
        params![message_id],
        row_to_outbox,
    )
    .optional()
}

/// Look up the outbox row whose PING carried `ping_id` (the ACK's only
/// correlation key — `message_id` never rides the wire).
pub fn get_by_ping_id(conn: &Connection, ping_id: &str) -> rusqlite::Result<Option<OutboxRow>> {
    conn.query_row(
        "SELECT message_id, ping_id, ping_nonce, contact_id, ciphertext, header_counter, header_nonce, status, attempts, next_retry_at, created_at
         FROM outbox_message WHERE ping_id = ?1",
        params![ping_id],
        row_to_outbox,
    )
    .optional()
}

fn row_to_outbox(row: &rusqlite::Row) -> rusqlite::Result<OutboxRow> {
    let ping_nonce_vec: Vec<u8> = row.get(2)?;
    let ping_nonce: [u8; 24] = ping_nonce_vec.try_into().unwrap_or([0u8; 24]);
    let nonce_vec: Vec<u8> = row.get(6)?;
    let header_nonce: [u8; 24] = nonce_vec.try_into().unwrap_or([0u8; 24]);
    let counter: i64 = row.get(5)?;
    Ok(OutboxRow {
        message_id: row.get(0)?,
        ping_id: row.get(1)?,
        ping_nonce,
        contact_id: row.get(3)?,
        ciphertext: row.get(4)?,
        header_counter: counter as u64,
        header_nonce,
        status: row.get(7)?,
        attempts: row.get(8)?,
        next_retry_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup_contact(storage: &Storage) -> i64 {
        storage
            .conn
            .execute(
                "INSERT INTO contact (id, display_name, onion_address, ed25519_pubkey, x25519_pubkey, created_at)
                 VALUES (1, 'bob', 'bbbb.onion', X'00', X'00', 0)",
                [],
            )
            .unwrap();
        1
    }

    #[test]
    fn enqueue_then_due_for_retry() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        let due = due_for_retry(&storage.conn, 0).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, STATUS_PENDING);
    }

    #[test]
    fn mark_failed_reschedules_within_backoff_bounds() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        let config = Config::default();
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        mark_failed(&storage.conn, "m1", 0, &config).unwrap();
        let row = get(&storage.conn, "m1").unwrap().unwrap();
        assert_eq!(row.attempts, 1);
        assert_eq!(row.status, STATUS_PENDING);
        assert!(row.next_retry_at >= 0);
    }

    #[test]
    fn mark_failed_gives_up_after_max_attempts() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        let mut config = Config::default();
        config.send_max_attempts = 2;
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        mark_failed(&storage.conn, "m1", 0, &config).unwrap();
        mark_failed(&storage.conn, "m1", 0, &config).unwrap();
        let row = get(&storage.conn, "m1").unwrap().unwrap();
        assert_eq!(row.status, STATUS_FAILED);
        assert_eq!(row.attempts, 2);
    }

    #[test]
    fn lookup_by_ping_id_finds_the_row_after_ping_delivered() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        let ping_id = get(&storage.conn, "m1").unwrap().unwrap().ping_id;
        mark_ping_delivered(&storage.conn, "m1").unwrap();
        let row = get_by_ping_id(&storage.conn, &ping_id).unwrap().unwrap();
        assert_eq!(row.message_id, "m1");
        assert!(get_by_ping_id(&storage.conn, "nope").unwrap().is_none());
    }

    #[test]
    fn ping_id_is_stable_across_retries_and_renewed_on_resend() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        let first = get(&storage.conn, "m1").unwrap().unwrap();

        mark_failed(&storage.conn, "m1", 0, &Config::default()).unwrap();
        let after_retry = get(&storage.conn, "m1").unwrap().unwrap();
        assert_eq!(first.ping_id, after_retry.ping_id);
        assert_eq!(first.ping_nonce, after_retry.ping_nonce);

        renew_for_resend(&storage.conn, "m1", 1).unwrap();
        let after_resend = get(&storage.conn, "m1").unwrap().unwrap();
        assert_ne!(first.ping_id, after_resend.ping_id);
        assert_eq!(after_resend.status, STATUS_PENDING);
    }

    #[test]
    fn delivered_message_is_not_retried() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        enqueue(&storage.conn, "m1", contact_id, b"ct", 0, &[0u8; 24], 0).unwrap();
        mark_delivered(&storage.conn, "m1").unwrap();
        let due = due_for_retry(&storage.conn, 1_000_000).unwrap();
        assert!(due.is_empty());
    }
}
