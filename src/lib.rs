//! SoulSpot Core Library
//!
//! Download orchestration engine for mirroring streaming-service libraries
//! into local audio files via an external Soulseek downloader (`slskd`).
//! Track intents become durable jobs driven through a multi-stage state
//! machine by background workers, with live progress streamed to clients.
//!
//! # Architecture
//!
//! - [`db`] - SQLite connection and schema management
//! - [`store`] - durable download rows, claims, blocklist
//! - [`downloader`] - search-and-fetch port and the slskd client
//! - [`breaker`] - circuit breaker guarding downloader calls
//! - [`quality`] - candidate ranking against the active profile
//! - [`events`] - in-process change fan-out for SSE
//! - [`settings`] - live-observed tunables
//! - [`track`] - track metadata mirror access
//! - [`library`] - finished-file hand-off seam
//! - [`workers`] - dispatcher, enqueue, status-sync, retry scheduler
//! - [`orchestrator`] - request-side service
//! - [`api`] - HTTP endpoints and the SSE stream

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod breaker;
pub mod db;
pub mod downloader;
pub mod events;
pub mod library;
pub mod orchestrator;
pub mod quality;
pub mod settings;
pub mod store;
pub mod track;
pub mod workers;

// Re-export commonly used types
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use db::Database;
pub use downloader::{
    GuardedDownloader, Hit, PortError, SearchAndFetch, SlskdClient, TransferState,
    TransferUpdate, classify_transfer_error,
};
pub use events::{DownloadChanged, EventBus};
pub use orchestrator::{BatchAction, Orchestrator, OrchestratorError};
pub use quality::{QualityProfile, score_hit};
pub use settings::{EngineConfig, InMemorySettings, SettingsReader, SettingsStore};
pub use store::{
    Blocklist, Candidate, Download, DownloadStatus, DownloadStore, ErrorCode, StoreError,
};
pub use track::{SqliteTrackReader, TrackInfo, TrackReader};
pub use workers::{
    DispatcherWorker, EngineContext, EnqueueWorker, RetryScheduler, Shutdown,
    StatusSyncWorker, WorkerHeartbeats,
};
