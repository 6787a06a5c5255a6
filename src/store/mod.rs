//! Durable persistence for download rows and the blocklist.
//!
//! This module provides the SQLite-backed job table the workers coordinate
//! through. Rows move through their lifecycle exclusively via:
//!
//! - [`DownloadStore::claim_next`] + the `release_*` family — the worker
//!   path. A claim is an exclusive lease (`locked_by`/`locked_at`); claims
//!   older than the lock timeout are considered abandoned and reclaimable.
//! - Conditional updates keyed on the expected status — the API and
//!   status-sync path. A conditional update that loses the race reports a
//!   conflict and mutates nothing.
//!
//! # Overview
//!
//! - [`Download`] / [`DownloadStatus`] - row entity and lifecycle states
//! - [`ErrorCode`] - persisted failure taxonomy
//! - [`DownloadStore`] - claims, releases, conditional updates, queries
//! - [`Blocklist`] - peers/files excluded from candidate selection

mod blocklist;
mod download;
mod error;

pub use blocklist::{Blocklist, BlocklistEntry};
pub use download::{
    Candidate, Download, DownloadStatus, ErrorCode, RetryClass, pause_sentinel,
};
pub use error::StoreError;

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persisted error messages are truncated to this many bytes.
const MAX_ERROR_MESSAGE_BYTES: usize = 2048;

/// Truncates an error message to the persisted cap on a char boundary.
#[must_use]
pub fn truncate_error_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE_BYTES {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Fields for a new download row.
#[derive(Debug, Clone)]
pub struct NewDownload {
    /// Track the row should materialize.
    pub track_id: String,
    /// Dispatch priority (higher = sooner).
    pub priority: i64,
    /// Retry budget.
    pub max_retries: i64,
    /// Deferral point; a future value creates the row in `scheduled`.
    pub scheduled_start: Option<DateTime<Utc>>,
}

/// Listing filter for the API.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Restrict to a single status.
    pub status: Option<DownloadStatus>,
    /// Page size; 0 means no limit.
    pub limit: i64,
    /// Page offset.
    pub offset: i64,
}

/// Outcome of a conditional (API-side) update.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// The row was mutated; carries the new state.
    Updated(Download),
    /// The row was already in an acceptable state; nothing changed.
    Unchanged(Download),
    /// The row is in a state the action does not apply to.
    Conflict(Download),
    /// No row with that ID exists.
    NotFound,
}

impl UpdateOutcome {
    /// The row after the operation, when one exists.
    #[must_use]
    pub fn row(&self) -> Option<&Download> {
        match self {
            Self::Updated(d) | Self::Unchanged(d) | Self::Conflict(d) => Some(d),
            Self::NotFound => None,
        }
    }
}

/// Download row persistence with atomic claim/update operations.
///
/// All mutations are serialized per row by SQLite; `claim_next` uses a
/// single `UPDATE ... RETURNING` statement so concurrent claimers can never
/// receive the same row.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    db: Database,
}

impl DownloadStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ==================== creation and lookup ====================

    /// Inserts a new row, enforcing the non-terminal queue cap.
    ///
    /// The row starts in `scheduled` when `scheduled_start` is set,
    /// otherwise `waiting`. New rows are appended to the end of the queue
    /// order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::QueueFull`] when the cap is reached, or
    /// [`StoreError::Database`] on query failure.
    #[instrument(skip(self, new), fields(track_id = %new.track_id))]
    pub async fn create(
        &self,
        new: &NewDownload,
        max_queue_size: i64,
        now: DateTime<Utc>,
    ) -> Result<Download> {
        let mut tx = self.db.pool().begin().await?;

        let non_terminal: i64 = sqlx::query(
            r"SELECT COUNT(*) as count FROM downloads
              WHERE status NOT IN ('completed', 'cancelled')",
        )
        .fetch_one(&mut *tx)
        .await?
        .get("count");

        if non_terminal >= max_queue_size {
            return Err(StoreError::QueueFull {
                limit: max_queue_size,
            });
        }

        let status = if new.scheduled_start.is_some() {
            DownloadStatus::Scheduled
        } else {
            DownloadStatus::Waiting
        };

        let row = sqlx::query_as::<_, Download>(
            r"INSERT INTO downloads (
                  track_id, status, priority, queue_position, max_retries,
                  scheduled_start, created_at, updated_at
              )
              VALUES (?, ?, ?,
                      (SELECT COALESCE(MAX(queue_position), -1) + 1 FROM downloads),
                      ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(&new.track_id)
        .bind(status.as_str())
        .bind(new.priority)
        .bind(new.max_retries)
        .bind(new.scheduled_start)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Gets a row by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row)
    }

    /// Finds the non-terminal row for a track, if any.
    ///
    /// Used by the enqueue idempotency guard.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(track_id = %track_id))]
    pub async fn find_active_by_track(&self, track_id: &str) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE track_id = ? AND status NOT IN ('completed', 'cancelled')
              ORDER BY created_at ASC
              LIMIT 1",
        )
        .bind(track_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Lists rows in queue order, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<Download>> {
        let limit = if query.limit > 0 { query.limit } else { i64::MAX };
        let rows = match query.status {
            Some(status) => {
                sqlx::query_as::<_, Download>(
                    r"SELECT * FROM downloads
                      WHERE status = ?
                      ORDER BY priority DESC, queue_position ASC, created_at ASC
                      LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(query.offset)
                .fetch_all(self.db.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Download>(
                    r"SELECT * FROM downloads
                      ORDER BY priority DESC, queue_position ASC, created_at ASC
                      LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(query.offset)
                .fetch_all(self.db.pool())
                .await?
            }
        };

        Ok(rows)
    }

    /// Counts rows matching the filter (ignoring pagination).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count(&self, status: Option<DownloadStatus>) -> Result<i64> {
        let count: i64 = match status {
            Some(status) => sqlx::query(r"SELECT COUNT(*) as count FROM downloads WHERE status = ?")
                .bind(status.as_str())
                .fetch_one(self.db.pool())
                .await?
                .get("count"),
            None => sqlx::query(r"SELECT COUNT(*) as count FROM downloads")
                .fetch_one(self.db.pool())
                .await?
                .get("count"),
        };

        Ok(count)
    }

    /// Returns row counts grouped by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn counts_by_status(&self) -> Result<Vec<(DownloadStatus, i64)>> {
        let rows = sqlx::query(r"SELECT status, COUNT(*) as count FROM downloads GROUP BY status")
            .fetch_all(self.db.pool())
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            if let Ok(status) = status.parse::<DownloadStatus>() {
                counts.push((status, row.get::<i64, _>("count")));
            }
        }
        Ok(counts)
    }

    /// Counts rows in the active set (`pending`, `queued`, `downloading`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_active(&self) -> Result<i64> {
        let count: i64 = sqlx::query(
            r"SELECT COUNT(*) as count FROM downloads
              WHERE status IN ('pending', 'queued', 'downloading')",
        )
        .fetch_one(self.db.pool())
        .await?
        .get("count");

        Ok(count)
    }

    /// Counts active rows whose candidate points at the given peer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn count_active_for_peer(&self, peer: &str) -> Result<i64> {
        let count: i64 = sqlx::query(
            r"SELECT COUNT(*) as count FROM downloads
              WHERE status IN ('pending', 'queued', 'downloading')
                AND candidate_peer = ?",
        )
        .bind(peer)
        .fetch_one(self.db.pool())
        .await?
        .get("count");

        Ok(count)
    }

    // ==================== claims and releases ====================

    /// Atomically claims the next unclaimed row in the requested states.
    ///
    /// Selection order: highest `priority`, then lowest `queue_position`,
    /// then oldest `created_at`. Rows whose lock is older than
    /// `lock_timeout` count as unclaimed. The whole operation is a single
    /// `UPDATE ... RETURNING`, so two concurrent claimers can never receive
    /// the same row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, states), fields(worker = %worker_id))]
    pub async fn claim_next(
        &self,
        worker_id: &str,
        states: &[DownloadStatus],
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<Option<Download>> {
        if states.is_empty() {
            return Ok(None);
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            r"UPDATE downloads
              SET locked_by = ?, locked_at = ?, updated_at = ?
              WHERE id = (
                  SELECT id FROM downloads
                  WHERE status IN ({placeholders})
                    AND (locked_by IS NULL OR locked_at < ?)
                  ORDER BY priority DESC, queue_position ASC, created_at ASC
                  LIMIT 1
              )
              RETURNING *"
        );

        let mut query = sqlx::query_as::<_, Download>(&sql)
            .bind(worker_id)
            .bind(now)
            .bind(now);
        for state in states {
            query = query.bind(state.as_str());
        }
        let row = query
            .bind(now - lock_timeout)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row)
    }

    /// Clears locks older than `now - lock_timeout`. Returns the number
    /// reclaimed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE locked_by IS NOT NULL AND locked_at < ?",
        )
        .bind(now)
        .bind(now - lock_timeout)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Releases a claim without changing row state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockLost`] if the worker no longer holds the
    /// claim, or [`StoreError::Database`] on query failure.
    #[instrument(skip(self), fields(worker = %worker_id))]
    pub async fn release_unchanged(
        &self,
        id: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE downloads
              SET locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE id = ? AND locked_by = ?",
        )
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(self.db.pool())
        .await?;

        check_lock_held(id, worker_id, result.rows_affected())
    }

    /// Releases a claim, transitioning `waiting -> pending` with the chosen
    /// candidate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockLost`] if the worker no longer holds the
    /// claim, or [`StoreError::Database`] on query failure.
    #[instrument(skip(self, candidate), fields(worker = %worker_id, peer = %candidate.peer))]
    pub async fn release_to_pending(
        &self,
        id: i64,
        worker_id: &str,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<Download> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'pending',
                  candidate_peer = ?, candidate_filename = ?,
                  candidate_size_bytes = ?, candidate_bitrate_kbps = ?,
                  candidate_format = ?,
                  locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE id = ? AND locked_by = ?
              RETURNING *",
        )
        .bind(&candidate.peer)
        .bind(&candidate.filename)
        .bind(candidate.size_bytes)
        .bind(candidate.bitrate_kbps)
        .bind(&candidate.format)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.ok_or_else(|| StoreError::LockLost {
            id,
            worker: worker_id.to_string(),
        })
    }

    /// Releases a claim, transitioning `pending -> queued` with the
    /// downloader's external ref.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockLost`] if the worker no longer holds the
    /// claim, or [`StoreError::Database`] on query failure.
    #[instrument(skip(self), fields(worker = %worker_id, external_ref = %external_ref))]
    pub async fn release_to_queued(
        &self,
        id: i64,
        worker_id: &str,
        external_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Download> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'queued', external_ref = ?, queued_at = ?,
                  locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE id = ? AND locked_by = ?
              RETURNING *",
        )
        .bind(external_ref)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.ok_or_else(|| StoreError::LockLost {
            id,
            worker: worker_id.to_string(),
        })
    }

    /// Releases a claim, bumping the row back to `waiting` for an
    /// alternative candidate. Charges the retry and records the error but
    /// does not touch `next_retry_at`; the dispatcher picks the row up on
    /// its next tick.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockLost`] if the worker no longer holds the
    /// claim, or [`StoreError::Database`] on query failure.
    #[instrument(skip(self, message), fields(worker = %worker_id, code = %code))]
    pub async fn release_to_waiting(
        &self,
        id: i64,
        worker_id: &str,
        code: ErrorCode,
        message: &str,
        retry_count: i64,
        now: DateTime<Utc>,
    ) -> Result<Download> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'waiting', retry_count = ?,
                  last_error_code = ?, last_error_message = ?,
                  candidate_peer = NULL, candidate_filename = NULL,
                  candidate_size_bytes = NULL, candidate_bitrate_kbps = NULL,
                  candidate_format = NULL,
                  locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE id = ? AND locked_by = ?
              RETURNING *",
        )
        .bind(retry_count)
        .bind(code.as_str())
        .bind(truncate_error_message(message))
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.ok_or_else(|| StoreError::LockLost {
            id,
            worker: worker_id.to_string(),
        })
    }

    /// Releases a claim, transitioning the row to `failed`.
    ///
    /// A non-null `next_retry_at` schedules a retry; `None` means the
    /// failure is terminal (budget exhausted or non-retryable code).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockLost`] if the worker no longer holds the
    /// claim, or [`StoreError::Database`] on query failure.
    #[instrument(skip(self, message), fields(worker = %worker_id, code = %code))]
    pub async fn release_failed(
        &self,
        id: i64,
        worker_id: &str,
        code: ErrorCode,
        message: &str,
        retry_count: i64,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Download> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'failed', retry_count = ?,
                  last_error_code = ?, last_error_message = ?,
                  next_retry_at = ?, completed_at = ?,
                  locked_by = NULL, locked_at = NULL, updated_at = ?
              WHERE id = ? AND locked_by = ?
              RETURNING *",
        )
        .bind(retry_count)
        .bind(code.as_str())
        .bind(truncate_error_message(message))
        .bind(next_retry_at)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        row.ok_or_else(|| StoreError::LockLost {
            id,
            worker: worker_id.to_string(),
        })
    }

    // ==================== status-sync conditional updates ====================

    /// Records transfer progress, moving `queued -> downloading` on first
    /// observation. Returns `None` if the row left the in-transfer states
    /// (e.g. cancelled mid-poll); late replies lose the race by design.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn mark_transfer_progress(
        &self,
        id: i64,
        bytes_done: i64,
        bytes_total: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'downloading', bytes_done = ?, bytes_total = ?,
                  started_at = COALESCE(started_at, ?), updated_at = ?
              WHERE id = ? AND status IN ('queued', 'downloading')
              RETURNING *",
        )
        .bind(bytes_done)
        .bind(bytes_total)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Marks an in-transfer row completed with its final path and byte
    /// counts. Conditional on the row still being `queued`/`downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(target_path = %target_path))]
    pub async fn mark_completed(
        &self,
        id: i64,
        target_path: &str,
        bytes_done: i64,
        bytes_total: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'completed', target_path = ?,
                  bytes_done = ?, bytes_total = ?,
                  completed_at = ?, updated_at = ?
              WHERE id = ? AND status IN ('queued', 'downloading')
              RETURNING *",
        )
        .bind(target_path)
        .bind(bytes_done)
        .bind(bytes_total)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Marks an in-transfer row failed. Conditional on the row still being
    /// `queued`/`downloading`. The external ref is kept: the transfer was
    /// really started.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, message), fields(code = %code))]
    pub async fn mark_transfer_failed(
        &self,
        id: i64,
        code: ErrorCode,
        message: &str,
        retry_count: i64,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'failed', retry_count = ?,
                  last_error_code = ?, last_error_message = ?,
                  next_retry_at = ?, completed_at = ?, updated_at = ?
              WHERE id = ? AND status IN ('queued', 'downloading')
              RETURNING *",
        )
        .bind(retry_count)
        .bind(code.as_str())
        .bind(truncate_error_message(message))
        .bind(next_retry_at)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Lists rows currently handed to the downloader, oldest-updated first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_in_transfer(&self, limit: i64) -> Result<Vec<Download>> {
        let rows = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE status IN ('queued', 'downloading')
              ORDER BY updated_at ASC
              LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    // ==================== API conditional updates ====================

    /// Cancels a row. Non-terminal rows transition to `cancelled`;
    /// `failed`/`cancelled` rows are an acceptable no-op; `completed` rows
    /// conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'cancelled', completed_at = ?, updated_at = ?,
                  locked_by = NULL, locked_at = NULL
              WHERE id = ? AND status NOT IN ('completed', 'cancelled', 'failed')
              RETURNING *",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(row));
        }

        match self.get(id).await? {
            None => Ok(UpdateOutcome::NotFound),
            Some(row) if row.status() == DownloadStatus::Completed => {
                Ok(UpdateOutcome::Conflict(row))
            }
            Some(row) => Ok(UpdateOutcome::Unchanged(row)),
        }
    }

    /// Sets the priority of a non-terminal row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn set_priority(
        &self,
        id: i64,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET priority = ?, updated_at = ?
              WHERE id = ? AND status NOT IN ('completed', 'cancelled')
              RETURNING *",
        )
        .bind(priority)
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(row));
        }
        match self.get(id).await? {
            None => Ok(UpdateOutcome::NotFound),
            Some(row) => Ok(UpdateOutcome::Conflict(row)),
        }
    }

    /// Pauses a pre-queue row (`waiting`/`pending`) by moving it to
    /// `scheduled` with a start that never comes due.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'scheduled', scheduled_start = ?, updated_at = ?,
                  locked_by = NULL, locked_at = NULL
              WHERE id = ? AND status IN ('waiting', 'pending')
              RETURNING *",
        )
        .bind(pause_sentinel())
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(row));
        }
        match self.get(id).await? {
            None => Ok(UpdateOutcome::NotFound),
            Some(row) if row.status() == DownloadStatus::Scheduled => {
                Ok(UpdateOutcome::Unchanged(row))
            }
            Some(row) => Ok(UpdateOutcome::Conflict(row)),
        }
    }

    /// Resumes a `scheduled` row back to `waiting`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: i64, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'waiting', scheduled_start = NULL, updated_at = ?
              WHERE id = ? AND status = 'scheduled'
              RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(row));
        }
        match self.get(id).await? {
            None => Ok(UpdateOutcome::NotFound),
            Some(row) if row.status() == DownloadStatus::Waiting => {
                Ok(UpdateOutcome::Unchanged(row))
            }
            Some(row) => Ok(UpdateOutcome::Conflict(row)),
        }
    }

    /// User-forced retry of a `failed` row: back to `waiting` immediately,
    /// retry budget reset. Rows already `waiting` are an acceptable no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn force_retry(&self, id: i64, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'waiting', retry_count = 0, next_retry_at = NULL,
                  external_ref = NULL, completed_at = NULL,
                  queued_at = NULL, started_at = NULL,
                  bytes_done = 0, bytes_total = NULL,
                  candidate_peer = NULL, candidate_filename = NULL,
                  candidate_size_bytes = NULL, candidate_bitrate_kbps = NULL,
                  candidate_format = NULL,
                  updated_at = ?
              WHERE id = ? AND status = 'failed'
              RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(row) = row {
            return Ok(UpdateOutcome::Updated(row));
        }
        match self.get(id).await? {
            None => Ok(UpdateOutcome::NotFound),
            Some(row) if row.status() == DownloadStatus::Waiting => {
                Ok(UpdateOutcome::Unchanged(row))
            }
            Some(row) => Ok(UpdateOutcome::Conflict(row)),
        }
    }

    /// Rewrites queue positions: listed ids first in the given order, then
    /// all remaining non-terminal rows in their current relative order.
    /// Returns the number of listed ids that were applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction fails.
    #[instrument(skip(self, ordered_ids), fields(count = ordered_ids.len()))]
    pub async fn reorder(&self, ordered_ids: &[i64], now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;

        let current: Vec<i64> = sqlx::query(
            r"SELECT id FROM downloads
              WHERE status NOT IN ('completed', 'cancelled')
              ORDER BY queue_position ASC, created_at ASC",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get("id"))
        .collect();

        let listed: Vec<i64> = ordered_ids
            .iter()
            .copied()
            .filter(|id| current.contains(id))
            .collect();
        let rest = current.iter().copied().filter(|id| !listed.contains(id));

        let mut position: i64 = 0;
        for id in listed.iter().copied().chain(rest) {
            sqlx::query(
                r"UPDATE downloads SET queue_position = ?, updated_at = ? WHERE id = ?",
            )
            .bind(position)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            position += 1;
        }

        tx.commit().await?;
        Ok(listed.len() as u64)
    }

    // ==================== retry scheduler queries ====================

    /// Rows eligible for reactivation: `failed`, retryable code, scheduled
    /// retry due. Terminal failures never carry a `next_retry_at`, so the
    /// due check alone excludes them.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Download>> {
        let tags = ErrorCode::retryable_tags()
            .iter()
            .map(|t| format!("'{t}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r"SELECT * FROM downloads
              WHERE status = 'failed'
                AND next_retry_at IS NOT NULL AND next_retry_at <= ?
                AND last_error_code IN ({tags})
                AND retry_count <= max_retries
              ORDER BY next_retry_at ASC
              LIMIT ?"
        );

        let rows = sqlx::query_as::<_, Download>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows)
    }

    /// Reactivates a `failed` row to `waiting` for another dispatch pass.
    /// The retry count is untouched: it was charged when the retry was
    /// scheduled. Transfer bookkeeping is reset so the next attempt starts
    /// clean.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn reactivate(&self, id: i64, now: DateTime<Utc>) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'waiting', next_retry_at = NULL,
                  external_ref = NULL, completed_at = NULL,
                  queued_at = NULL, started_at = NULL,
                  bytes_done = 0, bytes_total = NULL,
                  candidate_peer = NULL, candidate_filename = NULL,
                  candidate_size_bytes = NULL, candidate_bitrate_kbps = NULL,
                  candidate_format = NULL,
                  updated_at = ?
              WHERE id = ? AND status = 'failed'
              RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// `scheduled` rows whose start has come due (the pause sentinel never
    /// does).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn due_scheduled(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Download>> {
        let rows = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE status = 'scheduled'
                AND scheduled_start IS NOT NULL AND scheduled_start <= ?
              ORDER BY scheduled_start ASC
              LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    /// Promotes a due `scheduled` row to `waiting`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn promote_scheduled(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'waiting', scheduled_start = NULL, updated_at = ?
              WHERE id = ? AND status = 'scheduled'
              RETURNING *",
        )
        .bind(now)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row)
    }

    /// Deletes terminal rows whose `completed_at` is before the cutoff.
    /// Returns the number pruned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn prune_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM downloads
              WHERE status IN ('completed', 'cancelled')
                AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(cutoff)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

/// Returns `Ok(())` if at least one row was affected; otherwise the claim
/// was lost.
fn check_lock_held(id: i64, worker: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::LockLost {
            id,
            worker: worker.to_string(),
        })
    } else {
        Ok(())
    }
}
