//! Event types for the PixQ event system
//!
//! Events are broadcast via EventBus and serialized for SSE transmission.
//! All events use this central enum for type safety and exhaustive matching.

use crate::status::BatchStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Action the watchdog took on a stuck item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Requeued for another attempt
    Retry,
    /// Retries exhausted, marked failed
    Failed,
    /// Source bytes missing, marked orphaned
    Orphaned,
}

/// PixQ event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A completed upload created a batch and entered the job queue
    ///
    /// Triggers:
    /// - SSE: show the batch in the queue view
    BatchQueued {
        batch_id: Uuid,
        name: String,
        queue_position: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch moved between lifecycle states
    ///
    /// Triggers:
    /// - SSE: update batch state display
    BatchStatusChanged {
        batch_id: Uuid,
        status: BatchStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic counter snapshot while a batch is processing
    ///
    /// Emitted on a cadence (every 50th terminal item) and at sub-batch
    /// boundaries, not on every item.
    ///
    /// Triggers:
    /// - SSE: update progress bars
    BatchProgress {
        batch_id: Uuid,
        total: i64,
        processed: i64,
        success: i64,
        failure: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Batch reached a terminal status
    ///
    /// Triggers:
    /// - SSE: final state display
    BatchCompleted {
        batch_id: Uuid,
        status: BatchStatus,
        success: i64,
        failure: i64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The watchdog recovered a stuck item
    ///
    /// Triggers:
    /// - SSE: operator triage view
    ItemRecovered {
        item_id: Uuid,
        batch_id: Uuid,
        action: RecoveryAction,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A chunked upload session idled past its TTL and was discarded
    UploadSessionExpired {
        upload_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl IngestEvent {
    /// SSE event name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            IngestEvent::BatchQueued { .. } => "BatchQueued",
            IngestEvent::BatchStatusChanged { .. } => "BatchStatusChanged",
            IngestEvent::BatchProgress { .. } => "BatchProgress",
            IngestEvent::BatchCompleted { .. } => "BatchCompleted",
            IngestEvent::ItemRecovered { .. } => "ItemRecovered",
            IngestEvent::UploadSessionExpired { .. } => "UploadSessionExpired",
        }
    }
}

/// Event bus for broadcasting events to all subscribers
///
/// Uses tokio broadcast channel for multi-producer multi-consumer semantics.
/// Events are delivered to all active subscribers; slow subscribers that lag
/// behind the channel capacity miss events rather than blocking emitters.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// The pipeline never depends on listeners being present, so all
    /// emitters use this form.
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit_lossy(IngestEvent::BatchStatusChanged {
            batch_id: Uuid::new_v4(),
            status: BatchStatus::Processing,
            timestamp: chrono::Utc::now(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            IngestEvent::BatchStatusChanged { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            IngestEvent::BatchStatusChanged { .. }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit_lossy(IngestEvent::UploadSessionExpired {
            upload_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = IngestEvent::BatchProgress {
            batch_id: Uuid::new_v4(),
            total: 22,
            processed: 10,
            success: 9,
            failure: 1,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "BatchProgress");
        assert_eq!(json["total"], 22);
    }
}
