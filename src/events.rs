//! In-process fan-out of download state changes.
//!
//! Built on `tokio::sync::broadcast`: publishers never block on
//! subscribers, each subscriber has a bounded buffer (the channel
//! capacity), and a subscriber that falls behind observes a `Lagged`
//! error, which the SSE layer converts into a synthetic `Resync` event
//! telling the client to re-fetch the full list.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{Download, DownloadStatus};

/// Default per-subscriber buffer size.
pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// How often idle SSE connections receive a heartbeat.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Payload published on every persisted state or progress change.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadChanged {
    /// Row identifier.
    pub id: i64,
    /// Status after the change.
    pub status: DownloadStatus,
    /// Current priority.
    pub priority: i64,
    /// Retries charged so far.
    pub retry_count: i64,
    /// Bytes transferred.
    pub bytes_done: i64,
    /// Total bytes expected, when known.
    pub bytes_total: Option<i64>,
    /// Failure tag, when the row is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// When the change was persisted.
    pub updated_at: DateTime<Utc>,
}

impl DownloadChanged {
    /// Builds the event payload from a persisted row.
    #[must_use]
    pub fn from_row(row: &Download) -> Self {
        Self {
            id: row.id,
            status: row.status(),
            priority: row.priority,
            retry_count: row.retry_count,
            bytes_done: row.bytes_done,
            bytes_total: row.bytes_total,
            error_code: row.last_error_code.clone(),
            updated_at: row.updated_at,
        }
    }
}

/// Broadcast bus shared by workers, the orchestrator, and SSE streams.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DownloadChanged>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes a change. Never blocks; with no subscribers the event is
    /// dropped.
    pub fn publish(&self, event: DownloadChanged) {
        if self.tx.send(event).is_err() {
            debug!("download change published with no subscribers");
        }
    }

    /// Publishes the change event for a persisted row.
    pub fn publish_row(&self, row: &Download) {
        self.publish(DownloadChanged::from_row(row));
    }

    /// Subscribes with a fresh bounded buffer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadChanged> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(id: i64) -> DownloadChanged {
        DownloadChanged {
            id,
            status: DownloadStatus::Waiting,
            priority: 0,
            retry_count: 0,
            bytes_done: 0,
            bytes_total: None,
            error_code: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(event(1));
        bus.publish(event(2));

        assert_eq!(rx.recv().await.unwrap().id, 1);
        assert_eq!(rx.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for id in 0..10 {
            bus.publish(event(id));
        }

        // The oldest events were discarded; the receiver learns it lagged.
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));

        // After the lag signal the newest events are still readable.
        let next = rx.recv().await.unwrap();
        assert!(next.id >= 6);
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(event(7));

        assert_eq!(a.recv().await.unwrap().id, 7);
        assert_eq!(b.recv().await.unwrap().id, 7);
    }

    #[test]
    fn test_event_payload_serialization_omits_null_error() {
        let json = serde_json::to_string(&event(1)).unwrap();
        assert!(!json.contains("error_code"));
        assert!(json.contains("\"status\":\"waiting\""));
    }
}
