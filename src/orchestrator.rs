//! Request-side service: everything the HTTP API does to the job table.
//!
//! Mutations go through the store's conditional updates (no claims), so a
//! user action can never clobber a worker mid-transition; conflicts are
//! reported, not retried. Every mutation publishes a change event.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::breaker::BreakerSnapshot;
use crate::events::DownloadChanged;
use crate::settings::EngineConfig;
use crate::store::{
    Download, DownloadStatus, ListQuery, NewDownload, StoreError, UpdateOutcome,
};
use crate::track::TrackError;
use crate::workers::EngineContext;

/// Default retry budget for new rows.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Stable machine-readable reason surfaced to API clients.
pub const REASON_NOT_FOUND: &str = "NotFound";
/// Action does not apply to the row's current state.
pub const REASON_INVALID_TRANSITION: &str = "InvalidTransition";

/// Orchestrator failures, mapped to HTTP statuses by the API layer.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The non-terminal queue cap was hit.
    #[error("queue is full ({limit} non-terminal downloads)")]
    QueueFull {
        /// The configured cap.
        limit: i64,
    },

    /// No download with this ID.
    #[error("download not found: {0}")]
    NotFound(i64),

    /// The referenced track (or album) is not in the metadata mirror.
    #[error("unknown track or album: {0}")]
    UnknownTrack(String),

    /// The action does not apply to the row's current state.
    #[error("download {id} is {status}, action not applicable")]
    InvalidTransition {
        /// Target row.
        id: i64,
        /// Its current status.
        status: DownloadStatus,
    },

    /// Store failure; surfaces as HTTP 500.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Metadata failure; surfaces as HTTP 500.
    #[error("track metadata error: {0}")]
    Track(#[from] TrackError),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Bulk operation verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAction {
    /// Cancel the rows.
    Cancel,
    /// Force failed rows back to `waiting`, resetting their budget.
    Retry,
    /// Set a new priority.
    SetPriority,
    /// Park pre-queue rows.
    Pause,
    /// Release parked rows.
    Resume,
}

/// Per-id failure in a batch response.
#[derive(Debug, Clone, Serialize)]
pub struct BatchError {
    /// The row the action failed for.
    pub id: i64,
    /// Stable reason tag.
    pub reason: &'static str,
}

/// Batch outcome; always a full per-id report, never a partial HTTP error.
#[derive(Debug, Clone, Serialize, Default)]
pub struct BatchOutcome {
    /// Rows the action applied to (including acceptable no-ops).
    pub success_count: u64,
    /// Rows it failed for.
    pub failed_count: u64,
    /// One entry per failed row.
    pub errors: Vec<BatchError>,
}

/// Worker liveness entry for the health report.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    /// Worker name.
    pub name: String,
    /// When the worker last ticked.
    pub last_tick_at: DateTime<Utc>,
    /// Milliseconds since that tick.
    pub lag_ms: i64,
}

/// Engine health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Circuit breaker read model.
    pub breaker: BreakerSnapshot,
    /// Worker heartbeats.
    pub workers: Vec<WorkerHealth>,
    /// Row counts by status.
    pub counts_by_status: HashMap<String, i64>,
}

/// Request-side facade over the engine.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: EngineContext,
}

impl Orchestrator {
    /// Creates the orchestrator over the shared context.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Creates (or returns) the download for a track.
    ///
    /// Idempotent: when a non-terminal row already exists for the track it
    /// is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownTrack`] for tracks missing from the
    /// mirror, [`OrchestratorError::QueueFull`] at the cap.
    #[instrument(skip(self), fields(track_id = %track_id))]
    pub async fn enqueue(
        &self,
        track_id: &str,
        priority: i64,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> Result<Download> {
        if self.ctx.tracks.track(track_id).await?.is_none() {
            return Err(OrchestratorError::UnknownTrack(track_id.to_string()));
        }

        if let Some(existing) = self.ctx.store.find_active_by_track(track_id).await? {
            info!(id = existing.id, "track already queued, returning existing row");
            return Ok(existing);
        }

        let config = EngineConfig::load(self.ctx.settings.as_ref()).await;
        let now = Utc::now();
        let new = NewDownload {
            track_id: track_id.to_string(),
            priority,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_start: scheduled_start.filter(|start| *start > now),
        };

        let row = match self.ctx.store.create(&new, config.max_queue_size, now).await {
            Ok(row) => row,
            Err(StoreError::QueueFull { limit }) => {
                return Err(OrchestratorError::QueueFull { limit });
            }
            Err(err) => return Err(err.into()),
        };

        info!(id = row.id, status = %row.status(), "download created");
        self.ctx.events.publish(DownloadChanged::from_row(&row));
        Ok(row)
    }

    /// Enqueues every track of an album. Tracks already queued come back
    /// as their existing rows.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::UnknownTrack`] when the album has no tracks in
    /// the mirror; otherwise the same failures as [`Self::enqueue`].
    #[instrument(skip(self), fields(album_id = %album_id, source = %source))]
    pub async fn enqueue_album(
        &self,
        album_id: &str,
        source: &str,
        priority: i64,
    ) -> Result<Vec<Download>> {
        let track_ids = self.ctx.tracks.album_track_ids(album_id, source).await?;
        if track_ids.is_empty() {
            return Err(OrchestratorError::UnknownTrack(album_id.to_string()));
        }

        let mut rows = Vec::with_capacity(track_ids.len());
        for track_id in &track_ids {
            rows.push(self.enqueue(track_id, priority, None).await?);
        }
        Ok(rows)
    }

    /// Cancels a download. Non-terminal rows move to `cancelled`
    /// immediately; an in-flight transfer gets a best-effort downstream
    /// cancel whose failure is logged, never surfaced.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`] for unknown ids. Terminal rows are
    /// an acceptable no-op.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<Download> {
        let now = Utc::now();
        match self.ctx.store.cancel(id, now).await? {
            UpdateOutcome::Updated(row) => {
                if let Some(external_ref) = row.external_ref.clone() {
                    let downloader = Arc::clone(&self.ctx.downloader);
                    tokio::spawn(async move {
                        if let Err(err) = downloader.cancel(&external_ref).await {
                            warn!(external_ref = %external_ref, error = %err,
                                "best-effort downloader cancel failed");
                        }
                    });
                }
                info!(id, "download cancelled");
                self.ctx.events.publish(DownloadChanged::from_row(&row));
                Ok(row)
            }
            UpdateOutcome::Unchanged(row) | UpdateOutcome::Conflict(row) => Ok(row),
            UpdateOutcome::NotFound => Err(OrchestratorError::NotFound(id)),
        }
    }

    /// Changes a non-terminal row's priority.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`] or
    /// [`OrchestratorError::InvalidTransition`] for terminal rows.
    #[instrument(skip(self))]
    pub async fn reprioritize(&self, id: i64, priority: i64) -> Result<Download> {
        match self.ctx.store.set_priority(id, priority, Utc::now()).await? {
            UpdateOutcome::Updated(row) => {
                self.ctx.events.publish(DownloadChanged::from_row(&row));
                Ok(row)
            }
            UpdateOutcome::Unchanged(row) => Ok(row),
            UpdateOutcome::Conflict(row) => Err(OrchestratorError::InvalidTransition {
                id,
                status: row.status(),
            }),
            UpdateOutcome::NotFound => Err(OrchestratorError::NotFound(id)),
        }
    }

    /// Rewrites queue positions; ids missing from the list keep their
    /// relative order after the listed ones. Returns how many listed ids
    /// were applied.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self, ordered_ids), fields(count = ordered_ids.len()))]
    pub async fn reorder(&self, ordered_ids: &[i64]) -> Result<u64> {
        let now = Utc::now();
        let updated = self.ctx.store.reorder(ordered_ids, now).await?;

        for id in ordered_ids {
            if let Some(row) = self.ctx.store.get(*id).await? {
                self.ctx.events.publish(DownloadChanged::from_row(&row));
            }
        }
        Ok(updated)
    }

    /// Applies an action to each id, reporting per-id outcomes. Never
    /// fails the batch as a whole for per-row problems.
    ///
    /// # Errors
    ///
    /// Propagates store failures only.
    #[instrument(skip(self, ids), fields(action = ?action, count = ids.len()))]
    pub async fn batch(
        &self,
        action: BatchAction,
        ids: &[i64],
        priority: Option<i64>,
    ) -> Result<BatchOutcome> {
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();

        for &id in ids {
            let result = match action {
                BatchAction::Cancel => match self.cancel(id).await {
                    Ok(_) => Ok(()),
                    Err(OrchestratorError::NotFound(_)) => Err(REASON_NOT_FOUND),
                    Err(_) => Err(REASON_INVALID_TRANSITION),
                },
                BatchAction::Retry => match self.ctx.store.force_retry(id, now).await? {
                    UpdateOutcome::Updated(row) => {
                        self.ctx.events.publish(DownloadChanged::from_row(&row));
                        Ok(())
                    }
                    UpdateOutcome::Unchanged(_) => Ok(()),
                    UpdateOutcome::Conflict(_) => Err(REASON_INVALID_TRANSITION),
                    UpdateOutcome::NotFound => Err(REASON_NOT_FOUND),
                },
                BatchAction::SetPriority => {
                    match self
                        .ctx
                        .store
                        .set_priority(id, priority.unwrap_or(0), now)
                        .await?
                    {
                        UpdateOutcome::Updated(row) => {
                            self.ctx.events.publish(DownloadChanged::from_row(&row));
                            Ok(())
                        }
                        UpdateOutcome::Unchanged(_) => Ok(()),
                        UpdateOutcome::Conflict(_) => Err(REASON_INVALID_TRANSITION),
                        UpdateOutcome::NotFound => Err(REASON_NOT_FOUND),
                    }
                }
                BatchAction::Pause => match self.ctx.store.pause(id, now).await? {
                    UpdateOutcome::Updated(row) => {
                        self.ctx.events.publish(DownloadChanged::from_row(&row));
                        Ok(())
                    }
                    UpdateOutcome::Unchanged(_) => Ok(()),
                    UpdateOutcome::Conflict(_) => Err(REASON_INVALID_TRANSITION),
                    UpdateOutcome::NotFound => Err(REASON_NOT_FOUND),
                },
                BatchAction::Resume => match self.ctx.store.resume(id, now).await? {
                    UpdateOutcome::Updated(row) => {
                        self.ctx.events.publish(DownloadChanged::from_row(&row));
                        Ok(())
                    }
                    UpdateOutcome::Unchanged(_) => Ok(()),
                    UpdateOutcome::Conflict(_) => Err(REASON_INVALID_TRANSITION),
                    UpdateOutcome::NotFound => Err(REASON_NOT_FOUND),
                },
            };

            match result {
                Ok(()) => outcome.success_count += 1,
                Err(reason) => {
                    outcome.failed_count += 1;
                    outcome.errors.push(BatchError { id, reason });
                }
            }
        }

        Ok(outcome)
    }

    /// Lists downloads and the total matching count.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self))]
    pub async fn list(&self, query: &ListQuery) -> Result<(Vec<Download>, i64)> {
        let rows = self.ctx.store.list(query).await?;
        let total = self.ctx.store.count(query.status).await?;
        Ok((rows, total))
    }

    /// Gets one download.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`] for unknown ids.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Download> {
        self.ctx
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))
    }

    /// Builds the health report: breaker state, worker heartbeats, counts.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<HealthReport> {
        let now = Utc::now();
        let workers = self
            .ctx
            .heartbeats
            .snapshot()
            .into_iter()
            .map(|(name, last_tick_at)| WorkerHealth {
                name,
                last_tick_at,
                lag_ms: (now - last_tick_at).num_milliseconds(),
            })
            .collect();

        let counts_by_status = self
            .ctx
            .store
            .counts_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();

        Ok(HealthReport {
            breaker: self.ctx.breaker.snapshot(),
            workers,
            counts_by_status,
        })
    }

    /// The shared event bus, for SSE subscriptions.
    #[must_use]
    pub fn events(&self) -> &crate::events::EventBus {
        &self.ctx.events
    }
}
