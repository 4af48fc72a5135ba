//! Coarse, idempotent event bus for observers (UI, notifications).
//!
//! Events are reload triggers, never incremental deltas: an observer that
//! receives `MessageReceived { contact_id }` is expected to re-query
//! storage for that contact's thread, not to apply the event as a patch.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    MessageReceived { contact_id: i64 },
    NewPing { contact_id: i64 },
    DownloadFailed { contact_id: i64 },
    OutboxStatusChanged { message_id: String, status: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Publishing never fails the caller: if there are no subscribers the
    /// event is simply dropped, matching the "fire and forget" reload model.
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscriber_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(CoreEvent::NewPing { contact_id: 1 });
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(CoreEvent::MessageReceived { contact_id: 42 });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, CoreEvent::MessageReceived { contact_id: 42 });
    }
}
