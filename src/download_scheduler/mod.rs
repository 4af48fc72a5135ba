//! DownloadScheduler: per-contact UI-facing state machine governing when
//! a pending download is attempted and when the lock/typing indicator is
//! shown. Grounded on the teacher's `network::pingpong` retry-state
//! bookkeeping, generalized from a single global retry timer into a
//! per-contact map, with backoff delegated to the same base/cap/jitter
//! shape used by `outbox::backoff_delay_ms`.
//!
//! `foreground_contact` tracks which thread the UI currently has open, set
//! via `set_foreground` and consulted by the device-protection gate in
//! `on_ping_arrived`.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::config::Config;
use crate::events::{CoreEvent, EventBus};
use crate::ping_inbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactDownloadState {
    Idle,
    Downloading,
    Backoff,
    Paused,
}

struct ContactState {
    state: ContactDownloadState,
    attempts: u32,
    next_attempt_at: i64,
    has_downloaded_once: bool,
}

impl Default for ContactState {
    fn default() -> Self {
        Self {
            state: ContactDownloadState::Idle,
            attempts: 0,
            next_attempt_at: 0,
            has_downloaded_once: false,
        }
    }
}

/// Per-contact download state, shared across the async tasks that drive
/// receive and retry.
pub struct DownloadScheduler {
    contacts: Mutex<HashMap<i64, ContactState>>,
    device_protection_enabled: bool,
    foreground_contact: Mutex<Option<i64>>,
}

impl DownloadScheduler {
    pub fn new(device_protection_enabled: bool) -> Self {
        Self {
            contacts: Mutex::new(HashMap::new()),
            device_protection_enabled,
            foreground_contact: Mutex::new(None),
        }
    }

    pub fn state_of(&self, contact_id: i64) -> ContactDownloadState {
        self.contacts.lock().unwrap().entry(contact_id).or_default().state
    }

    /// Record which contact's thread the UI currently has open. Consulted
    /// by `on_ping_arrived`'s device-protection gate on the next inbound
    /// ping for that contact.
    pub fn set_foreground(&self, contact_id: Option<i64>) {
        *self.foreground_contact.lock().unwrap() = contact_id;
    }

    pub fn is_foreground(&self, contact_id: i64) -> bool {
        *self.foreground_contact.lock().unwrap() == Some(contact_id)
    }

    /// A PING arrived for `contact_id`. Returns `true` if the caller should
    /// proceed to claim and start a download immediately.
    pub fn on_ping_arrived(&self, contact_id: i64, contact_is_active_view: bool) -> bool {
        let mut contacts = self.contacts.lock().unwrap();
        let entry = contacts.entry(contact_id).or_default();
        if entry.state == ContactDownloadState::Paused {
            return false;
        }
        if self.device_protection_enabled {
            if !contact_is_active_view {
                return false;
            }
            entry.has_downloaded_once
        } else {
            true
        }
    }

    pub fn on_download_started(&self, contact_id: i64) {
        let mut contacts = self.contacts.lock().unwrap();
        let entry = contacts.entry(contact_id).or_default();
        if matches!(entry.state, ContactDownloadState::Idle | ContactDownloadState::Backoff) {
            entry.state = ContactDownloadState::Downloading;
        }
    }

    pub fn on_download_succeeded(&self, contact_id: i64) {
        let mut contacts = self.contacts.lock().unwrap();
        let entry = contacts.entry(contact_id).or_default();
        entry.state = ContactDownloadState::Idle;
        entry.attempts = 0;
        entry.has_downloaded_once = true;
    }

    pub fn on_download_failed_transient(&self, contact_id: i64, now: i64, config: &Config, events: &EventBus) {
        let mut contacts = self.contacts.lock().unwrap();
        let entry = contacts.entry(contact_id).or_default();
        entry.state = ContactDownloadState::Backoff;
        entry.attempts += 1;
        entry.next_attempt_at = now + backoff_delay_seconds(entry.attempts, config);
        drop(contacts);
        events.publish(CoreEvent::DownloadFailed { contact_id });
    }

    /// `MANUAL_REQUIRED -> DOWNLOAD_QUEUED` via `ping_inbox::claim_for_download`.
    /// Returns `true` only if this call actually won the claim.
    pub fn on_user_lock_tapped(
        &self,
        conn: &rusqlite::Connection,
        contact_id: i64,
        ping_id: &str,
        now: i64,
    ) -> rusqlite::Result<bool> {
        let claimed = ping_inbox::claim_for_download(conn, ping_id, now)? > 0;
        if claimed {
            let mut contacts = self.contacts.lock().unwrap();
            contacts.entry(contact_id).or_default().state = ContactDownloadState::Downloading;
        }
        Ok(claimed)
    }

    pub fn on_paused(&self, contact_id: i64) {
        self.contacts.lock().unwrap().entry(contact_id).or_default().state = ContactDownloadState::Paused;
    }

    pub fn on_resumed(&self, contact_id: i64) {
        let mut contacts = self.contacts.lock().unwrap();
        let entry = contacts.entry(contact_id).or_default();
        if entry.state == ContactDownloadState::Paused {
            entry.state = ContactDownloadState::Idle;
        }
    }

    /// Contacts whose backoff has elapsed and are due for a retry attempt.
    pub fn due_for_retry(&self, now: i64) -> Vec<i64> {
        self.contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.state == ContactDownloadState::Backoff && s.next_attempt_at <= now)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn backoff_delay_seconds(attempts: u32, config: &Config) -> i64 {
    let exp = config.send_backoff_base_ms.saturating_mul(1u64 << attempts.min(20));
    let capped = exp.min(config.send_backoff_cap_ms);
    let jitter_span = (capped as f64 * config.jitter_fraction) as i64;
    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-jitter_span..=jitter_span);
    ((capped as i64 + jitter).max(0)) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_protection_blocks_autodownload_until_first_success() {
        let scheduler = DownloadScheduler::new(true);
        assert!(!scheduler.on_ping_arrived(1, true));
        scheduler.on_download_started(1);
        scheduler.on_download_succeeded(1);
        assert!(scheduler.on_ping_arrived(1, true));
    }

    #[test]
    fn device_protection_ignores_background_contacts() {
        let scheduler = DownloadScheduler::new(true);
        scheduler.on_download_succeeded(1);
        assert!(!scheduler.on_ping_arrived(1, false));
    }

    #[test]
    fn without_device_protection_always_downloads() {
        let scheduler = DownloadScheduler::new(false);
        assert!(scheduler.on_ping_arrived(1, false));
    }

    #[test]
    fn failed_transient_enters_backoff_then_becomes_due() {
        let scheduler = DownloadScheduler::new(false);
        let config = Config::default();
        scheduler.on_download_started(1);
        scheduler.on_download_failed_transient(1, 0, &config, &EventBus::default());
        assert_eq!(scheduler.state_of(1), ContactDownloadState::Backoff);
        assert!(scheduler.due_for_retry(0).is_empty());
        assert_eq!(scheduler.due_for_retry(10_000), vec![1]);
    }

    #[test]
    fn download_failed_transient_publishes_download_failed_event() {
        let scheduler = DownloadScheduler::new(false);
        let config = Config::default();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        scheduler.on_download_failed_transient(1, 0, &config, &bus);
        assert_eq!(rx.try_recv().unwrap(), CoreEvent::DownloadFailed { contact_id: 1 });
    }

    #[test]
    fn foreground_contact_is_tracked() {
        let scheduler = DownloadScheduler::new(true);
        assert!(!scheduler.is_foreground(1));
        scheduler.set_foreground(Some(1));
        assert!(scheduler.is_foreground(1));
        assert!(!scheduler.is_foreground(2));
        scheduler.set_foreground(None);
        assert!(!scheduler.is_foreground(1));
    }

    #[test]
    fn pause_suppresses_state_changes_until_resumed() {
        let scheduler = DownloadScheduler::new(false);
        scheduler.on_paused(1);
        assert!(!scheduler.on_ping_arrived(1, true));
        scheduler.on_resumed(1);
        assert_eq!(scheduler.state_of(1), ContactDownloadState::Idle);
    }

    #[test]
    fn user_lock_tap_claims_via_ping_inbox() {
        use crate::storage::Storage;
        let storage = Storage::open_in_memory().unwrap();
        storage
            .conn
            .execute(
                "INSERT INTO contact (id, display_name, onion_address, ed25519_pubkey, x25519_pubkey, created_at)
                 VALUES (1, 'c', 'cccc.onion', X'00', X'00', 0)",
                [],
            )
            .unwrap();
        ping_inbox::record(&storage.conn, "p1", 1, b"x", 0).unwrap();
        ping_inbox::claim_for_download(&storage.conn, "p1", 0).unwrap();
        ping_inbox::mark_manual_required(&storage.conn, "p1", 0).unwrap();

        let scheduler = DownloadScheduler::new(true);
        let claimed = scheduler.on_user_lock_tapped(&storage.conn, 1, "p1", 1).unwrap();
        assert!(claimed);
        assert_eq!(scheduler.state_of(1), ContactDownloadState::Downloading);
    }
}
