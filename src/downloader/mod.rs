//! Port abstraction over the external search-and-fetch downloader.
//!
//! The engine never talks to `slskd` directly; it consumes the
//! [`SearchAndFetch`] trait. Production wires in [`SlskdClient`] behind
//! [`GuardedDownloader`] (the circuit-breaker wrapper); tests supply
//! scripted in-memory implementations.

mod guarded;
mod slskd;

pub use guarded::GuardedDownloader;
pub use slskd::SlskdClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::ErrorCode;

/// Result type for port operations.
pub type PortResult<T> = std::result::Result<T, PortError>;

/// A single search result offered by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hit {
    /// Peer (slskd username) offering the file.
    pub peer: String,
    /// Remote filename, including the peer's directory layout.
    pub filename: String,
    /// Advertised size in bytes.
    pub size_bytes: i64,
    /// Advertised bitrate; not every peer reports one.
    pub bitrate_kbps: Option<i64>,
    /// Declared format, when the downloader reports one; otherwise the
    /// scorer detects it from the filename extension.
    pub format: Option<String>,
}

/// Transfer state as reported by the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Accepted, waiting in the peer's queue.
    Queued,
    /// Bytes are moving.
    Transferring,
    /// Finished successfully.
    Completed,
    /// Cancelled on the downloader side.
    Cancelled,
    /// Failed on the downloader side.
    Errored,
}

/// A point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUpdate {
    /// Current state.
    pub state: TransferState,
    /// Bytes transferred so far.
    pub bytes_done: i64,
    /// Total bytes expected, when known.
    pub bytes_total: Option<i64>,
    /// Local path of the finished file; set on completion.
    pub local_path: Option<String>,
    /// Downloader error string; set when `state` is `Errored`.
    pub error: Option<String>,
}

/// Failures surfaced by the port.
///
/// `Unavailable`, `Timeout`, and `Transport` are transport-class: they feed
/// the circuit breaker. The rest are answers from a live downloader.
#[derive(Debug, Error)]
pub enum PortError {
    /// The downloader is unreachable or the breaker is open.
    #[error("downloader unavailable: {reason}")]
    Unavailable {
        /// Why the call was not serviced.
        reason: String,
    },

    /// The call exceeded its deadline.
    #[error("timeout after {seconds}s during {operation}")]
    Timeout {
        /// Which port operation timed out.
        operation: &'static str,
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// The downloader throttled the request.
    #[error("downloader rate limited the request")]
    RateLimited,

    /// The downloader does not know the requested resource.
    #[error("resource not found on downloader")]
    NotFound,

    /// The downloader refused the request.
    #[error("request rejected by downloader: {reason}")]
    Rejected {
        /// The downloader's refusal message.
        reason: String,
    },

    /// Connection-level failure.
    #[error("transport error calling downloader: {0}")]
    Transport(#[from] reqwest::Error),
}

impl PortError {
    /// True for failures that should increment the circuit breaker.
    #[must_use]
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Transport(_)
        )
    }

    /// Default taxonomy tag for this failure. Call sites may override where
    /// context matters (a `NotFound` during status polling means the
    /// downloader lost the transfer, not that the file is gone).
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Unavailable { .. } => ErrorCode::DownloaderUnavailable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::NotFound => ErrorCode::FileNotFound,
            Self::Rejected { .. } => ErrorCode::TransferRejected,
            Self::Transport(_) => ErrorCode::NetworkError,
        }
    }
}

/// Client contract for the external downloader.
///
/// Every method has an explicit deadline inside the implementation; on
/// expiry the call fails with [`PortError::Timeout`].
#[async_trait]
pub trait SearchAndFetch: Send + Sync {
    /// Runs a text search and returns all hits collected before the search
    /// completes or the deadline expires.
    async fn search(&self, query: &str) -> PortResult<Vec<Hit>>;

    /// Asks the downloader to begin fetching a file. Returns the external
    /// ref identifying the transfer.
    async fn enqueue(
        &self,
        peer: &str,
        filename: &str,
        size_bytes: i64,
        priority: i64,
    ) -> PortResult<String>;

    /// Reports the current state of a transfer.
    async fn status(&self, external_ref: &str) -> PortResult<TransferUpdate>;

    /// Cancels a transfer. Idempotent on the downloader side.
    async fn cancel(&self, external_ref: &str) -> PortResult<()>;

    /// Cheap liveness probe used for breaker half-open tests.
    async fn ping(&self) -> PortResult<()>;
}

/// Maps a downloader transfer error string onto the taxonomy.
///
/// | Error contains | Tag | Rationale |
/// |---|---|---|
/// | "not shared", "no such file" | `FILE_NOT_FOUND` | peer stopped sharing |
/// | "banned", "blocked" | `PEER_BLOCKED_US` | peer refuses this client |
/// | "rejected", "denied" | `TRANSFER_REJECTED` | try another candidate |
/// | "timed out", "timeout" | `TIMEOUT` | wait and retry |
/// | "disconnected", "connection" | `NETWORK_ERROR` | wait and retry |
/// | anything else | `TRANSFER_FAILED` | retryable, alternative candidate |
#[must_use]
pub fn classify_transfer_error(error: &str) -> ErrorCode {
    let lowered = error.to_lowercase();
    if lowered.contains("not shared") || lowered.contains("no such file") {
        ErrorCode::FileNotFound
    } else if lowered.contains("banned") || lowered.contains("blocked") {
        ErrorCode::PeerBlockedUs
    } else if lowered.contains("rejected") || lowered.contains("denied") {
        ErrorCode::TransferRejected
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        ErrorCode::Timeout
    } else if lowered.contains("disconnected") || lowered.contains("connection") {
        ErrorCode::NetworkError
    } else {
        ErrorCode::TransferFailed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_class_counts_toward_breaker() {
        assert!(
            PortError::Unavailable {
                reason: "down".to_string()
            }
            .counts_toward_breaker()
        );
        assert!(
            PortError::Timeout {
                operation: "status",
                seconds: 5
            }
            .counts_toward_breaker()
        );
    }

    #[test]
    fn test_answer_class_does_not_count_toward_breaker() {
        assert!(!PortError::NotFound.counts_toward_breaker());
        assert!(!PortError::RateLimited.counts_toward_breaker());
        assert!(
            !PortError::Rejected {
                reason: "queue full".to_string()
            }
            .counts_toward_breaker()
        );
    }

    #[test]
    fn test_default_error_codes() {
        assert_eq!(
            PortError::Timeout {
                operation: "search",
                seconds: 10
            }
            .error_code(),
            ErrorCode::Timeout
        );
        assert_eq!(PortError::RateLimited.error_code(), ErrorCode::RateLimited);
        assert_eq!(
            PortError::Unavailable {
                reason: "down".to_string()
            }
            .error_code(),
            ErrorCode::DownloaderUnavailable
        );
    }

    #[test]
    fn test_classify_transfer_error_known_strings() {
        assert_eq!(
            classify_transfer_error("File not shared."),
            ErrorCode::FileNotFound
        );
        assert_eq!(
            classify_transfer_error("You are banned"),
            ErrorCode::PeerBlockedUs
        );
        assert_eq!(
            classify_transfer_error("Transfer rejected by peer"),
            ErrorCode::TransferRejected
        );
        assert_eq!(
            classify_transfer_error("Request timed out"),
            ErrorCode::Timeout
        );
        assert_eq!(
            classify_transfer_error("peer disconnected mid-transfer"),
            ErrorCode::NetworkError
        );
    }

    #[test]
    fn test_classify_transfer_error_unknown_is_retryable() {
        let code = classify_transfer_error("something inexplicable");
        assert_eq!(code, ErrorCode::TransferFailed);
        assert!(code.is_retryable());
    }
}
