//! PingInbox: durable, crash-safe state machine for every observed inbound
//! PING. Every transition is a `rusqlite` CAS update guarded by a rank
//! comparison so duplicate PINGs or out-of-order callbacks never regress
//! a row — grounded on the idempotent, forward-progress philosophy of
//! the teacher's `ack_state.rs` (duplicate ACKs are accepted as no-ops,
//! out-of-order ACKs are logged but never rejected).
//!
//! State values are exactly the ones named in the contract
//! (`PING_SEEN=0, PONG_SENT=1, MSG_STORED=2, DOWNLOAD_QUEUED=10,
//! FAILED_TEMP=11, MANUAL_REQUIRED=12`), but those raw integers are not a
//! total order — `DOWNLOAD_QUEUED`/`FAILED_TEMP`/`MANUAL_REQUIRED` are
//! lateral pre-PONG substates a row can cycle through on retry. The CAS
//! condition is therefore evaluated against a derived `rank`, not the raw
//! state byte: see `rank()`.

use rusqlite::{params, Connection, OptionalExtension};

pub const PING_SEEN: i32 = 0;
pub const PONG_SENT: i32 = 1;
pub const MSG_STORED: i32 = 2;
pub const DOWNLOAD_QUEUED: i32 = 10;
pub const FAILED_TEMP: i32 = 11;
pub const MANUAL_REQUIRED: i32 = 12;

/// Linearise the state space for CAS comparisons. Lateral pre-PONG
/// substates share a rank so a row may cycle `DOWNLOAD_QUEUED ->
/// FAILED_TEMP -> DOWNLOAD_QUEUED` (retry) or `MANUAL_REQUIRED ->
/// DOWNLOAD_QUEUED` (user tap) without that being mistaken for regression.
pub fn rank(state: i32) -> i32 {
    match state {
        PING_SEEN => 0,
        DOWNLOAD_QUEUED | FAILED_TEMP | MANUAL_REQUIRED => 1,
        PONG_SENT => 2,
        MSG_STORED => 3,
        _ => i32::MIN,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingInboxRow {
    pub ping_id: String,
    pub contact_id: i64,
    pub state: i32,
    pub first_seen_at: i64,
    pub last_updated_at: i64,
    pub attempt_count: i64,
    pub ping_wire_bytes: Vec<u8>,
}

/// Silent wire-tag bytes: processed, but never rendered to the user.
pub const SILENT_TAG_PROFILE_UPDATE: u8 = 0x0F;
pub const SILENT_TAG_REACTION: u8 = 0x10;

pub fn is_silent(wire_bytes: &[u8]) -> bool {
    matches!(wire_bytes.first(), Some(&SILENT_TAG_PROFILE_UPDATE) | Some(&SILENT_TAG_REACTION))
}

/// Insert a new row in `PING_SEEN`, or — if one already exists for this
/// `ping_id` — bump `attempt_count`/`last_updated_at` without touching
/// `state`. Returns `true` if this is the first time we've seen this ping.
pub fn record(
    conn: &Connection,
    ping_id: &str,
    contact_id: i64,
    wire_bytes: &[u8],
    now: i64,
) -> rusqlite::Result<bool> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT attempt_count FROM ping_inbox WHERE ping_id = ?1",
            params![ping_id],
            |row| row.get(0),
        )
        .optional()?;

    if existing.is_some() {
        conn.execute(
            "UPDATE ping_inbox SET attempt_count = attempt_count + 1, last_updated_at = ?2 WHERE ping_id = ?1",
            params![ping_id, now],
        )?;
        Ok(false)
    } else {
        conn.execute(
            "INSERT INTO ping_inbox (ping_id, contact_id, state, first_seen_at, last_updated_at, attempt_count, ping_wire_bytes)
             VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5)",
            params![ping_id, contact_id, PING_SEEN, now, wire_bytes],
        )?;
        Ok(true)
    }
}

fn cas_update(
    conn: &Connection,
    ping_id: &str,
    new_state: i32,
    now: i64,
    max_rank_before: i32,
) -> rusqlite::Result<usize> {
    // rusqlite has no portable way to express `rank(state) < x` in SQL
    // without a custom function, so the rank check is done in two steps
    // inside a single statement via a CASE expression mirroring `rank()`.
    conn.execute(
        "UPDATE ping_inbox SET state = ?2, last_updated_at = ?3
         WHERE ping_id = ?1 AND (
            CASE state
                WHEN 0 THEN 0
                WHEN 10 THEN 1 WHEN 11 THEN 1 WHEN 12 THEN 1
                WHEN 1 THEN 2
                WHEN 2 THEN 3
                ELSE -999999
            END
         ) < ?4",
        params![ping_id, new_state, now, max_rank_before],
    )
}

/// Claim a row for download: `PING_SEEN`, `FAILED_TEMP`, `MANUAL_REQUIRED`
/// and a no-op re-claim of `DOWNLOAD_QUEUED` all succeed; `PONG_SENT` and
/// `MSG_STORED` do not regress. Returns the number of rows affected (0
/// means another caller already claimed it, or it is already past PONG).
pub fn claim_for_download(conn: &Connection, ping_id: &str, now: i64) -> rusqlite::Result<usize> {
    cas_update(conn, ping_id, DOWNLOAD_QUEUED, now, rank(PONG_SENT))
}

pub fn mark_pong_sent(conn: &Connection, ping_id: &str, now: i64) -> rusqlite::Result<usize> {
    cas_update(conn, ping_id, PONG_SENT, now, rank(PONG_SENT) + 1)
}

pub fn mark_msg_stored(conn: &Connection, ping_id: &str, now: i64) -> rusqlite::Result<usize> {
    cas_update(conn, ping_id, MSG_STORED, now, rank(MSG_STORED) + 1)
}

pub fn mark_failed_temp(conn: &Connection, ping_id: &str, now: i64) -> rusqlite::Result<usize> {
    cas_update(conn, ping_id, FAILED_TEMP, now, rank(PONG_SENT))
}

pub fn mark_manual_required(conn: &Connection, ping_id: &str, now: i64) -> rusqlite::Result<usize> {
    cas_update(conn, ping_id, MANUAL_REQUIRED, now, rank(PONG_SENT))
}

/// Rows in a non-terminal state for a contact, for UI rendering.
pub fn renderable(conn: &Connection, contact_id: i64) -> rusqlite::Result<Vec<PingInboxRow>> {
    let mut stmt = conn.prepare(
        "SELECT ping_id, contact_id, state, first_seen_at, last_updated_at, attempt_count, ping_wire_bytes
         FROM ping_inbox WHERE contact_id = ?1 AND state != ?2",
    )?;
    let rows = stmt
        .query_map(params![contact_id, MSG_STORED], |row| {
            Ok(PingInboxRow {
                ping_id: row.get(0)?,
                contact_id: row.get(1)?,
                state: row.get(2)?,
                first_seen_at: row.get(3)?,
                last_updated_at: row.get(4)?,
                attempt_count: row.get(5)?,
                ping_wire_bytes: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get(conn: &Connection, ping_id: &str) -> rusqlite::Result<Option<PingInboxRow>> {
    conn.query_row(
        "SELECT ping_id, contact_id, state, first_seen_at, last_updated_at, attempt_count, ping_wire_bytes
         FROM ping_inbox WHERE ping_id = ?1",
        params![ping_id],
        |row| {
            Ok(PingInboxRow {
                ping_id: row.get(0)?,
                contact_id: row.get(1)?,
                state: row.get(2)?,
                first_seen_at: row.get(3)?,
                last_updated_at: row.get(4)?,
                attempt_count: row.get(5)?,
                ping_wire_bytes: row.get(6)?,
            })
        },
    )
    .optional()
}

/// Garbage collection policy (spec section 7): MSG_STORED older than 30
/// days, PING_SEEN older than 30 days (abandoned), PONG_SENT older than 7
/// days (stuck) are all deleted.
pub fn gc(conn: &Connection, now: i64) -> rusqlite::Result<usize> {
    const DAY: i64 = 86_400;
    let mut deleted = 0;
    deleted += conn.execute(
        "DELETE FROM ping_inbox WHERE state = ?1 AND last_updated_at < ?2",
        params![MSG_STORED, now - 30 * DAY],
    )?;
    deleted += conn.execute(
        "DELETE FROM ping_inbox WHERE state = ?1 AND last_updated_at < ?2",
        params![PING_SEEN, now - 30 * DAY],
    )?;
    deleted += conn.execute(
        "DELETE FROM ping_inbox WHERE state = ?1 AND last_updated_at < ?2",
        params![PONG_SENT, now - 7 * DAY],
    )?;
    Ok(deleted)
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
                 VALUES (1, 'alice', 'aaaa.onion', X'00', X'00', 0)",
                [],
            )
            .unwrap();
        1
    }

    #[test]
    fn record_is_idempotent_and_bumps_attempts() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        let first = record(&storage.conn, "p1", contact_id, b"hello", 0).unwrap();
        assert!(first);
        let second = record(&storage.conn, "p1", contact_id, b"hello", 1).unwrap();
        assert!(!second);
        let row = get(&storage.conn, "p1").unwrap().unwrap();
        assert_eq!(row.attempt_count, 2);
        assert_eq!(row.state, PING_SEEN);
    }

    #[test]
    fn claim_for_download_succeeds_once_from_ping_seen() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        record(&storage.conn, "p1", contact_id, b"hello", 0).unwrap();
        assert_eq!(claim_for_download(&storage.conn, "p1", 1).unwrap(), 1);
        // Re-claiming while still DOWNLOAD_QUEUED is a harmless no-op write.
        assert_eq!(claim_for_download(&storage.conn, "p1", 2).unwrap(), 1);
    }

    #[test]
    fn claim_never_regresses_past_pong_sent() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        record(&storage.conn, "p1", contact_id, b"hello", 0).unwrap();
        claim_for_download(&storage.conn, "p1", 1).unwrap();
        mark_pong_sent(&storage.conn, "p1", 2).unwrap();
        assert_eq!(claim_for_download(&storage.conn, "p1", 3).unwrap(), 0);
        let row = get(&storage.conn, "p1").unwrap().unwrap();
        assert_eq!(row.state, PONG_SENT);
    }

    #[test]
    fn retry_cycle_from_failed_temp_back_to_download_queued() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        record(&storage.conn, "p1", contact_id, b"hello", 0).unwrap();
        claim_for_download(&storage.conn, "p1", 1).unwrap();
        mark_failed_temp(&storage.conn, "p1", 2).unwrap();
        assert_eq!(claim_for_download(&storage.conn, "p1", 3).unwrap(), 1);
    }

    #[test]
    fn msg_stored_is_terminal() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        record(&storage.conn, "p1", contact_id, b"hello", 0).unwrap();
        claim_for_download(&storage.conn, "p1", 1).unwrap();
        mark_pong_sent(&storage.conn, "p1", 2).unwrap();
        mark_msg_stored(&storage.conn, "p1", 3).unwrap();
        assert_eq!(mark_failed_temp(&storage.conn, "p1", 4).unwrap(), 0);
        let row = get(&storage.conn, "p1").unwrap().unwrap();
        assert_eq!(row.state, MSG_STORED);
    }

    #[test]
    fn silent_tag_detection() {
        assert!(is_silent(&[0x0F, 1, 2]));
        assert!(is_silent(&[0x10]));
        assert!(!is_silent(&[0x01]));
    }

    #[test]
    fn gc_deletes_stale_terminal_and_stuck_rows() {
        let storage = Storage::open_in_memory().unwrap();
        let contact_id = setup_contact(&storage);
        record(&storage.conn, "stale-seen", contact_id, b"x", 0).unwrap();
        record(&storage.conn, "stuck-pong", contact_id, b"x", 0).unwrap();
        claim_for_download(&storage.conn, "stuck-pong", 0).unwrap();
        mark_pong_sent(&storage.conn, "stuck-pong", 0).unwrap();

        let deleted = gc(&storage.conn, 40 * 86_400).unwrap();
        assert_eq!(deleted, 2);
        assert!(get(&storage.conn, "stale-seen").unwrap().is_none());
        assert!(get(&storage.conn, "stuck-pong").unwrap().is_none());
    }
}
