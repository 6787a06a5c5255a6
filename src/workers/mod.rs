//! Background workers driving the download lifecycle.
//!
//! Four long-lived loops share the job table through the store's atomic
//! claims and conditional updates:
//!
//! - [`DispatcherWorker`] - `waiting -> pending` via provider search
//! - [`EnqueueWorker`] - `pending -> queued` via the downloader
//! - [`StatusSyncWorker`] - `queued`/`downloading` -> terminal, drives the
//!   breaker
//! - [`RetryScheduler`] - reactivates due failures, promotes due scheduled
//!   rows, housekeeping
//!
//! Every worker re-reads [`EngineConfig`] at the top of each tick, beats a
//! shared heartbeat registry for the health endpoint, and exposes its
//! `tick` publicly so tests can drive time explicitly.

mod dispatcher;
mod enqueue;
mod retry;
mod status_sync;

pub use dispatcher::DispatcherWorker;
pub use enqueue::EnqueueWorker;
pub use retry::RetryScheduler;
pub use status_sync::StatusSyncWorker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::breaker::CircuitBreaker;
use crate::downloader::SearchAndFetch;
use crate::events::EventBus;
use crate::library::LibraryImporter;
use crate::settings::SettingsReader;
use crate::store::{Blocklist, DownloadStore, StoreError};
use crate::track::{TrackError, TrackReader};

/// Errors a worker tick can surface. Downloader I/O failures never appear
/// here; they are classified and persisted on the row instead.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A store operation failed; the tick is abandoned and retried next
    /// cadence.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A metadata lookup failed.
    #[error("track metadata error: {0}")]
    Track(#[from] TrackError),
}

/// Result type for worker ticks.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Everything a worker needs, bundled so construction sites stay small.
#[derive(Clone)]
pub struct EngineContext {
    /// Download row persistence.
    pub store: DownloadStore,
    /// Blocklist persistence.
    pub blocklist: Blocklist,
    /// Live tunables.
    pub settings: Arc<dyn SettingsReader>,
    /// Track metadata mirror.
    pub tracks: Arc<dyn TrackReader>,
    /// Breaker-guarded downloader port.
    pub downloader: Arc<dyn SearchAndFetch>,
    /// Finished-file hand-off.
    pub importer: Arc<dyn LibraryImporter>,
    /// Shared circuit breaker (for config refresh and health).
    pub breaker: Arc<CircuitBreaker>,
    /// Change fan-out.
    pub events: EventBus,
    /// Worker liveness registry.
    pub heartbeats: Arc<WorkerHeartbeats>,
}

/// Shared shutdown flag for all worker loops.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
}

impl Shutdown {
    /// Creates a not-yet-triggered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals every loop to exit after its current tick.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Last-tick timestamps per worker, read by the health endpoint.
#[derive(Debug, Default)]
pub struct WorkerHeartbeats {
    ticks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl WorkerHeartbeats {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a tick for the named worker.
    pub fn beat(&self, name: &str, now: DateTime<Utc>) {
        let mut ticks = match self.ticks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ticks.insert(name.to_string(), now);
    }

    /// Snapshot of every worker's last tick, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        let ticks = match self.ticks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries: Vec<(String, DateTime<Utc>)> =
            ticks.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeats_record_latest_tick() {
        let beats = WorkerHeartbeats::new();
        let first = Utc::now();
        let second = first + chrono::Duration::seconds(5);

        beats.beat("dispatcher", first);
        beats.beat("dispatcher", second);
        beats.beat("enqueue", first);

        let snapshot = beats.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0], ("dispatcher".to_string(), second));
        assert_eq!(snapshot[1], ("enqueue".to_string(), first));
    }

    #[test]
    fn test_shutdown_flag() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }
}
