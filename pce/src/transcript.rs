//! Transcript hub: append-only log plus live fan-out.
//!
//! The store's transcript table is the single source of truth; streams are
//! views of it. Every append goes to the table first (assigning the
//! cursor), then to the broadcast channel. Delivery over the channel is
//! at-least-once per live subscriber; reconnecting clients catch up from
//! the table via `items_since` and resume from their cursor.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::PceResult;
use crate::store::StateStore;
use crate::types::{TranscriptItem, TranscriptKind};

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug)]
pub struct TranscriptHub {
    sender: broadcast::Sender<TranscriptItem>,
}

impl Default for TranscriptHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Append one item through the store and push it to live subscribers.
    pub fn append(
        &self,
        store: &StateStore,
        kind: TranscriptKind,
        agent: Option<&str>,
        payload: &Value,
        correlation_id: &str,
        decision_id: Option<&str>,
    ) -> PceResult<TranscriptItem> {
        let item = store.append_transcript(kind, agent, payload, correlation_id, decision_id)?;
        // No live subscribers is fine; the table still has the item.
        let _ = self.sender.send(item.clone());
        Ok(item)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptItem> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_persists_then_broadcasts() {
        let store = StateStore::open_in_memory().expect("store");
        let hub = TranscriptHub::new();
        let mut rx = hub.subscribe();

        let item = hub
            .append(
                &store,
                TranscriptKind::EventIngested,
                None,
                &json!({"event_id": "e-1"}),
                "c-1",
                Some("e-1"),
            )
            .expect("append");
        assert_eq!(item.cursor, 1);

        let received = rx.recv().await.expect("recv");
        assert_eq!(received.cursor, 1);
        assert_eq!(received.kind, TranscriptKind::EventIngested);

        // The table has it too, for catch-up reads.
        let items = store.transcript_since(0).expect("since");
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn append_without_subscribers_is_not_an_error() {
        let store = StateStore::open_in_memory().expect("store");
        let hub = TranscriptHub::new();
        assert_eq!(hub.subscriber_count(), 0);
        hub.append(
            &store,
            TranscriptKind::StateUpdated,
            None,
            &json!({}),
            "c-1",
            None,
        )
        .expect("append");
    }
}
