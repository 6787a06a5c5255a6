//! Download row types, status definitions, and the error-code taxonomy.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a download row.
///
/// `Waiting` is the initial state; `Completed` and `Cancelled` are terminal.
/// `Failed` is terminal only once the retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for the dispatcher to find a candidate.
    Waiting,
    /// Candidate selected; waiting to be handed to the downloader.
    Pending,
    /// Accepted by the downloader; transfer not yet observed.
    Queued,
    /// Transfer in progress on the downloader.
    Downloading,
    /// Transfer finished; file on disk.
    Completed,
    /// Errored; may be reactivated by the retry scheduler.
    Failed,
    /// Terminated by user action.
    Cancelled,
    /// Deferred until `scheduled_start` (also the paused representation).
    Scheduled,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Scheduled => "scheduled",
        }
    }

    /// True for states no worker or scheduler will ever move the row out of.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States counted against `download.max_concurrent`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Downloading)
    }

    /// All declared status values, in lifecycle order.
    #[must_use]
    pub fn all() -> [Self; 8] {
        [
            Self::Waiting,
            Self::Pending,
            Self::Queued,
            Self::Downloading,
            Self::Completed,
            Self::Failed,
            Self::Cancelled,
            Self::Scheduled,
        ]
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// How a failure should be retried, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Wait out a back-off window, then search again.
    Wait,
    /// Try a different candidate immediately; do not extend the back-off.
    AlternativeCandidate,
    /// Retrying would not help.
    Terminal,
}

/// Stable error tags persisted on failed rows.
///
/// The tag strings are part of the API contract; they never change once
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Outbound call exceeded its deadline.
    Timeout,
    /// Connection-level failure reaching the downloader.
    NetworkError,
    /// Downloader throttled the request.
    RateLimited,
    /// Circuit breaker open or downloader refusing connections.
    DownloaderUnavailable,
    /// Downloader no longer knows the external ref it issued.
    LostByDownloader,
    /// Peer rejected the transfer request.
    TransferRejected,
    /// Transfer started and then errored.
    TransferFailed,
    /// Peer no longer shares the file.
    FileNotFound,
    /// Peer has blocked this client.
    PeerBlockedUs,
    /// Downloaded data failed validation.
    InvalidFile,
    /// Search produced no acceptable candidate.
    NoResults,
}

impl ErrorCode {
    /// Returns the persisted tag string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::DownloaderUnavailable => "DOWNLOADER_UNAVAILABLE",
            Self::LostByDownloader => "LOST_BY_DOWNLOADER",
            Self::TransferRejected => "TRANSFER_REJECTED",
            Self::TransferFailed => "TRANSFER_FAILED",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::PeerBlockedUs => "PEER_BLOCKED_US",
            Self::InvalidFile => "INVALID_FILE",
            Self::NoResults => "NO_RESULTS",
        }
    }

    /// Classification used by workers and the retry scheduler.
    ///
    /// `NoResults` is a `Wait` retry until the budget runs out; the budget
    /// check happens where the retry is scheduled, not here.
    #[must_use]
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Timeout
            | Self::NetworkError
            | Self::RateLimited
            | Self::DownloaderUnavailable
            | Self::LostByDownloader
            | Self::NoResults => RetryClass::Wait,
            Self::TransferRejected | Self::TransferFailed => RetryClass::AlternativeCandidate,
            Self::FileNotFound | Self::PeerBlockedUs | Self::InvalidFile => RetryClass::Terminal,
        }
    }

    /// True if a failed row with this code may be reactivated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retry_class() != RetryClass::Terminal
    }

    /// Tag strings eligible for retry-scheduler reactivation.
    #[must_use]
    pub fn retryable_tags() -> &'static [&'static str] {
        &[
            "TIMEOUT",
            "NETWORK_ERROR",
            "RATE_LIMITED",
            "DOWNLOADER_UNAVAILABLE",
            "LOST_BY_DOWNLOADER",
            "TRANSFER_REJECTED",
            "TRANSFER_FAILED",
            "NO_RESULTS",
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIMEOUT" => Ok(Self::Timeout),
            "NETWORK_ERROR" => Ok(Self::NetworkError),
            "RATE_LIMITED" => Ok(Self::RateLimited),
            "DOWNLOADER_UNAVAILABLE" => Ok(Self::DownloaderUnavailable),
            "LOST_BY_DOWNLOADER" => Ok(Self::LostByDownloader),
            "TRANSFER_REJECTED" => Ok(Self::TransferRejected),
            "TRANSFER_FAILED" => Ok(Self::TransferFailed),
            "FILE_NOT_FOUND" => Ok(Self::FileNotFound),
            "PEER_BLOCKED_US" => Ok(Self::PeerBlockedUs),
            "INVALID_FILE" => Ok(Self::InvalidFile),
            "NO_RESULTS" => Ok(Self::NoResults),
            _ => Err(format!("invalid error code: {s}")),
        }
    }
}

/// A specific `{peer, filename}` chosen by the quality scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Peer (slskd username) offering the file.
    pub peer: String,
    /// Remote filename, exactly as returned by the search.
    pub filename: String,
    /// Advertised file size in bytes.
    pub size_bytes: i64,
    /// Advertised bitrate; peers do not always report one.
    pub bitrate_kbps: Option<i64>,
    /// Format detected from the filename extension.
    pub format: String,
}

/// The paused representation: a `scheduled_start` that never comes due.
///
/// # Panics
///
/// Never panics; the components are compile-time constants in range.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn pause_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0).unwrap()
}

/// A single download row.
#[derive(Debug, Clone, FromRow)]
pub struct Download {
    /// Unique identifier.
    pub id: i64,
    /// Track this row materializes; immutable after creation.
    pub track_id: String,
    /// Current lifecycle state (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Higher priority rows are dispatched first (default 0).
    pub priority: i64,
    /// Tiebreaker among equal priorities; lower goes first.
    pub queue_position: i64,
    /// Retries charged so far.
    pub retry_count: i64,
    /// Retry budget for this row.
    pub max_retries: i64,
    /// When the next scheduled retry comes due, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure tag (see [`ErrorCode`]).
    pub last_error_code: Option<String>,
    /// Last failure message, truncated to 2 KiB.
    pub last_error_message: Option<String>,
    /// Key issued by the downloader once the transfer is accepted.
    pub external_ref: Option<String>,
    /// Chosen candidate peer.
    pub candidate_peer: Option<String>,
    /// Chosen candidate filename.
    pub candidate_filename: Option<String>,
    /// Chosen candidate size.
    pub candidate_size_bytes: Option<i64>,
    /// Chosen candidate bitrate.
    pub candidate_bitrate_kbps: Option<i64>,
    /// Chosen candidate format.
    pub candidate_format: Option<String>,
    /// Local path reported by the downloader on completion.
    pub target_path: Option<String>,
    /// Bytes transferred so far.
    pub bytes_done: i64,
    /// Total bytes expected, when known.
    pub bytes_total: Option<i64>,
    /// Worker holding the claim, if any.
    pub locked_by: Option<String>,
    /// When the claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Deferral point for `scheduled` rows.
    pub scheduled_start: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the downloader accepted the transfer.
    pub queued_at: Option<DateTime<Utc>>,
    /// When the transfer was first observed moving.
    pub started_at: Option<DateTime<Utc>>,
    /// When the row reached `completed`, `failed`, or `cancelled`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Waiting` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Waiting)
    }

    /// Returns the parsed last error code, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.last_error_code.as_deref().and_then(|s| s.parse().ok())
    }

    /// Assembles the flattened candidate columns, if a candidate is set.
    #[must_use]
    pub fn candidate(&self) -> Option<Candidate> {
        let peer = self.candidate_peer.clone()?;
        let filename = self.candidate_filename.clone()?;
        Some(Candidate {
            peer,
            filename,
            size_bytes: self.candidate_size_bytes.unwrap_or(0),
            bitrate_kbps: self.candidate_bitrate_kbps,
            format: self.candidate_format.clone().unwrap_or_default(),
        })
    }

    /// True if the row still has retry budget left to charge.
    #[must_use]
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// True if the row is paused (scheduled with the sentinel start).
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.status() == DownloadStatus::Scheduled
            && self.scheduled_start.is_some_and(|s| s >= pause_sentinel())
    }
}

impl fmt::Display for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Download {{ id: {}, track: {}, status: {} }}",
            self.id,
            self.track_id,
            self.status()
        )
    }
}
