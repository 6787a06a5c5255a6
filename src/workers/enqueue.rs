//! Enqueue worker: hands `pending` rows to the external downloader.
//!
//! A rejected candidate is blocklisted and the row returns to `waiting` so
//! the dispatcher can pick an alternative. Downloader unavailability leaves
//! the row `pending`; the breaker paces the next attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::{EngineContext, Result, Shutdown};
use crate::downloader::PortError;
use crate::events::DownloadChanged;
use crate::settings::EngineConfig;
use crate::store::{Candidate, Download, DownloadStatus, ErrorCode, StoreError};

/// Heartbeat name and claim owner for this worker.
const WORKER_NAME: &str = "enqueue";

/// Promotes `pending` rows to `queued` via the downloader.
pub struct EnqueueWorker {
    ctx: EngineContext,
}

impl EnqueueWorker {
    /// Creates the worker over the shared context.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Long-lived loop; exits when `shutdown` triggers.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!("enqueue worker started");
        while !shutdown.is_triggered() {
            let config = EngineConfig::load(self.ctx.settings.as_ref()).await;
            let now = Utc::now();
            self.ctx.heartbeats.beat(WORKER_NAME, now);

            if let Err(err) = self.tick(&config, now).await {
                if matches!(err, super::WorkerError::Store(StoreError::LockLost { .. })) {
                    debug!(error = %err, "claim lost mid-tick");
                } else {
                    error!(error = %err, "enqueue tick failed");
                }
            }

            tokio::time::sleep(config.dispatch_interval).await;
        }
        info!("enqueue worker stopped");
    }

    /// One enqueue pass. Public so tests can drive time explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`super::WorkerError`] on store failure; the caller logs and
    /// retries next tick.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, config: &EngineConfig, now: DateTime<Utc>) -> Result<()> {
        let Some(row) = self
            .ctx
            .store
            .claim_next(
                WORKER_NAME,
                &[DownloadStatus::Pending],
                now,
                config.lock_timeout,
            )
            .await?
        else {
            return Ok(());
        };

        let Some(candidate) = row.candidate() else {
            // A pending row without a candidate cannot progress; send it
            // back through dispatch.
            warn!(id = row.id, "pending row has no candidate");
            let updated = self
                .ctx
                .store
                .release_to_waiting(
                    row.id,
                    WORKER_NAME,
                    ErrorCode::TransferFailed,
                    "pending row had no candidate",
                    row.retry_count,
                    now,
                )
                .await?;
            self.ctx.events.publish(DownloadChanged::from_row(&updated));
            return Ok(());
        };

        // Re-check the caps: another worker may have filled them since
        // dispatch admitted this row. The row itself is already in the
        // active set, so a strict comparison detects only *additional*
        // occupancy.
        if self.ctx.store.count_active().await? > config.max_concurrent
            || self.ctx.store.count_active_for_peer(&candidate.peer).await?
                > config.max_concurrent_per_peer
        {
            debug!(id = row.id, "caps filled since dispatch, deferring enqueue");
            self.ctx.store.release_unchanged(row.id, WORKER_NAME, now).await?;
            return Ok(());
        }

        match self
            .ctx
            .downloader
            .enqueue(
                &candidate.peer,
                &candidate.filename,
                candidate.size_bytes,
                row.priority,
            )
            .await
        {
            Ok(external_ref) => {
                let updated = self
                    .ctx
                    .store
                    .release_to_queued(row.id, WORKER_NAME, &external_ref, now)
                    .await?;
                info!(id = row.id, external_ref = %external_ref, "transfer queued");
                self.ctx.events.publish(DownloadChanged::from_row(&updated));
            }
            Err(err @ (PortError::Rejected { .. } | PortError::NotFound)) => {
                self.reject_candidate(&row, &candidate, &err, now).await?;
            }
            Err(err) => {
                // Unavailable / timeout / transport / rate limited: stay
                // pending, the breaker backs off callers.
                debug!(id = row.id, error = %err, "downloader unavailable, keeping row pending");
                self.ctx.store.release_unchanged(row.id, WORKER_NAME, now).await?;
            }
        }

        Ok(())
    }

    /// The downloader answered but refused this candidate: blocklist the
    /// exact file and let the dispatcher pick a different one, or fail
    /// terminally when the budget is spent.
    async fn reject_candidate(
        &self,
        row: &Download,
        candidate: &Candidate,
        err: &PortError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let code = match err {
            PortError::NotFound => ErrorCode::FileNotFound,
            _ => ErrorCode::TransferRejected,
        };
        let message = err.to_string();

        self.ctx
            .blocklist
            .add(&candidate.peer, Some(&candidate.filename), &message, None, now)
            .await?;

        let updated = if row.has_retry_budget() {
            self.ctx
                .store
                .release_to_waiting(
                    row.id,
                    WORKER_NAME,
                    code,
                    &message,
                    row.retry_count + 1,
                    now,
                )
                .await?
        } else {
            self.ctx
                .store
                .release_failed(
                    row.id,
                    WORKER_NAME,
                    code,
                    &message,
                    row.retry_count,
                    None,
                    now,
                )
                .await?
        };

        info!(
            id = row.id,
            peer = %candidate.peer,
            code = %code,
            status = %updated.status(),
            "candidate rejected by downloader"
        );
        self.ctx.events.publish(DownloadChanged::from_row(&updated));
        Ok(())
    }
}
