use crate::models::ReceiptStatus;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Events pushed to clients watching a receipt. Mirrors the WS payloads
/// one-to-one, so serialization shape is part of the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptEvent {
    /// Intermediate transition while the job is running.
    StatusUpdated {
        receipt_id: Uuid,
        status: ReceiptStatus,
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Terminal event: the pipeline finished, one way or the other.
    ProcessingComplete {
        receipt_id: Uuid,
        status: ReceiptStatus,
        item_count: usize,
        confidence: Option<f64>,
    },
}

impl ReceiptEvent {
    pub fn receipt_id(&self) -> Uuid {
        match self {
            ReceiptEvent::StatusUpdated { receipt_id, .. }
            | ReceiptEvent::ProcessingComplete { receipt_id, .. } => *receipt_id,
        }
    }
}

/// Per-receipt broadcast topics. Owned by `AppState` and passed in by the
/// caller everywhere; there is no module-level hub.
///
/// The job runner publishes strictly in state-machine order from a single
/// worker task, so subscribers observe transitions in order.
pub struct StatusHub {
    topics: DashMap<Uuid, broadcast::Sender<ReceiptEvent>>,
}

const TOPIC_CAPACITY: usize = 64;

impl StatusHub {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Subscribe to one receipt's updates, creating the topic on demand.
    pub fn subscribe(&self, receipt_id: Uuid) -> broadcast::Receiver<ReceiptEvent> {
        self.topics
            .entry(receipt_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event; a topic nobody watches is silently skipped.
    pub fn publish(&self, event: ReceiptEvent) {
        let receipt_id = event.receipt_id();
        let gone = match self.topics.get(&receipt_id) {
            Some(sender) => sender.send(event).is_err(),
            None => return,
        };
        // Last receiver went away; drop the topic.
        if gone {
            self.topics.remove(&receipt_id);
            debug!(%receipt_id, "dropped update topic with no subscribers");
        }
    }

    pub fn status_updated(
        &self,
        receipt_id: Uuid,
        status: ReceiptStatus,
        message: Option<String>,
    ) {
        self.publish(ReceiptEvent::StatusUpdated {
            receipt_id,
            status,
            message,
            timestamp: Utc::now(),
        });
    }

    pub fn processing_complete(
        &self,
        receipt_id: Uuid,
        status: ReceiptStatus,
        item_count: usize,
        confidence: Option<f64>,
    ) {
        self.publish(ReceiptEvent::ProcessingComplete {
            receipt_id,
            status,
            item_count,
            confidence,
        });
    }

    #[cfg(test)]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_events_in_order() {
        let hub = StatusHub::new();
        let receipt_id = Uuid::new_v4();
        let mut rx = hub.subscribe(receipt_id);

        hub.status_updated(receipt_id, ReceiptStatus::OcrInProgress, None);
        hub.processing_complete(receipt_id, ReceiptStatus::Ready, 3, Some(0.9));

        match rx.recv().await.unwrap() {
            ReceiptEvent::StatusUpdated { status, .. } => {
                assert_eq!(status, ReceiptStatus::OcrInProgress)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ReceiptEvent::ProcessingComplete {
                status, item_count, ..
            } => {
                assert_eq!(status, ReceiptStatus::Ready);
                assert_eq!(item_count, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn events_for_other_receipts_are_not_delivered() {
        let hub = StatusHub::new();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = hub.subscribe(watched);

        hub.status_updated(other, ReceiptStatus::OcrInProgress, None);
        hub.status_updated(watched, ReceiptStatus::Ready, None);

        match rx.recv().await.unwrap() {
            ReceiptEvent::StatusUpdated { receipt_id, .. } => assert_eq!(receipt_id, watched),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let hub = StatusHub::new();
        hub.status_updated(Uuid::new_v4(), ReceiptStatus::Ready, None);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn topic_is_dropped_after_last_subscriber() {
        let hub = StatusHub::new();
        let receipt_id = Uuid::new_v4();
        let rx = hub.subscribe(receipt_id);
        assert_eq!(hub.topic_count(), 1);
        drop(rx);

        hub.status_updated(receipt_id, ReceiptStatus::Ready, None);
        assert_eq!(hub.topic_count(), 0);
    }

    #[test]
    fn event_serialization_shape() {
        let event = ReceiptEvent::StatusUpdated {
            receipt_id: Uuid::nil(),
            status: ReceiptStatus::OcrInProgress,
            message: Some("picked up".into()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_updated");
        assert_eq!(json["status"], "ocr_in_progress");
    }
}
