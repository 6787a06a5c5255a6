//! HTTP surface: JSON endpoints plus the SSE change stream.
//!
//! All endpoints consume and produce JSON; timestamps are RFC 3339 UTC.
//! Batch operations always answer 200 with per-id outcomes.

mod error;
mod handlers;
mod sse;

pub use error::ApiError;

use axum::Router;
use axum::routing::{get, patch, post};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::orchestrator::Orchestrator;
use crate::store::{Candidate, Download, DownloadStatus};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    /// Request-side engine facade.
    pub orchestrator: Orchestrator,
}

/// Builds the API router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/downloads", post(handlers::enqueue).get(handlers::list))
        .route("/downloads/album", post(handlers::enqueue_album))
        .route("/downloads/batch", post(handlers::batch))
        .route("/downloads/reorder", patch(handlers::reorder))
        .route("/downloads/stream", get(sse::stream))
        .route("/downloads/health", get(handlers::health))
        .route(
            "/downloads/:id",
            get(handlers::get_download)
                .patch(handlers::reprioritize)
                .delete(handlers::cancel),
        )
        .with_state(state)
}

/// Wire representation of a download row.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadDto {
    /// Row identifier.
    pub id: i64,
    /// Track this row materializes.
    pub track_id: String,
    /// Lifecycle state.
    pub status: DownloadStatus,
    /// Dispatch priority.
    pub priority: i64,
    /// Queue order tiebreaker.
    pub queue_position: i64,
    /// Retries charged.
    pub retry_count: i64,
    /// Retry budget.
    pub max_retries: i64,
    /// Next scheduled retry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    /// Last failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    /// Downloader transfer key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Chosen candidate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    /// Final file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    /// Bytes transferred.
    pub bytes_done: i64,
    /// Total bytes expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<i64>,
    /// Deferral point for scheduled rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_start: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// When the downloader accepted the transfer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    /// When bytes first moved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the row reached a terminal-ish state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Download> for DownloadDto {
    fn from(row: Download) -> Self {
        let candidate = row.candidate();
        Self {
            id: row.id,
            track_id: row.track_id,
            status: row.status_str.parse().unwrap_or(DownloadStatus::Waiting),
            priority: row.priority,
            queue_position: row.queue_position,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            next_retry_at: row.next_retry_at,
            last_error_code: row.last_error_code,
            last_error_message: row.last_error_message,
            external_ref: row.external_ref,
            candidate,
            target_path: row.target_path,
            bytes_done: row.bytes_done,
            bytes_total: row.bytes_total,
            scheduled_start: row.scheduled_start,
            created_at: row.created_at,
            updated_at: row.updated_at,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}
