//! Error types for download persistence operations.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The non-terminal row count has reached `download.max_queue_size`.
    #[error("queue is full ({limit} non-terminal downloads)")]
    QueueFull {
        /// The configured cap that was hit.
        limit: i64,
    },

    /// No download exists with the given ID.
    #[error("download not found: {0}")]
    NotFound(i64),

    /// A release was attempted by a worker that no longer holds the claim.
    #[error("claim on download {id} is no longer held by {worker}")]
    LockLost {
        /// The row whose claim was lost.
        id: i64,
        /// The worker that tried to release it.
        worker: String,
    },
}
