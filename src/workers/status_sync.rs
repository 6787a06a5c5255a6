//! Status sync: reconciles in-transfer rows against the downloader.
//!
//! Each tick polls every `queued`/`downloading` row (oldest-updated first,
//! bounded batch), applies the observed transitions through conditional
//! updates, and publishes a change event for every row whose state or byte
//! counters moved. All polling goes through the breaker-guarded port; when
//! the breaker trips mid-batch the tick aborts, and the loop sleeps the
//! recovery window plus jitter instead of spinning.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use super::{EngineContext, Result, Shutdown};
use crate::downloader::{PortError, TransferState, TransferUpdate, classify_transfer_error};
use crate::events::DownloadChanged;
use crate::settings::EngineConfig;
use crate::store::{Download, ErrorCode, RetryClass};

/// Heartbeat name for this worker.
const WORKER_NAME: &str = "status_sync";

/// Rows polled per tick.
const SYNC_BATCH_SIZE: i64 = 50;

/// Maximum jitter added to the breaker back-off sleep.
const MAX_BREAKER_JITTER_MS: u64 = 1000;

/// Reconciles transfer progress and terminal outcomes.
pub struct StatusSyncWorker {
    ctx: EngineContext,
}

impl StatusSyncWorker {
    /// Creates the worker over the shared context.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Long-lived loop; exits when `shutdown` triggers.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!("status sync started");
        while !shutdown.is_triggered() {
            let config = EngineConfig::load(self.ctx.settings.as_ref()).await;
            self.ctx.breaker.set_config(config.breaker);
            let now = Utc::now();
            self.ctx.heartbeats.beat(WORKER_NAME, now);

            if let Err(err) = self.tick(&config, now).await {
                error!(error = %err, "status sync tick failed");
            }

            let sleep = if self.ctx.breaker.is_open(Utc::now()) {
                // Do not spin against an open breaker.
                let recovery = config
                    .breaker
                    .recovery
                    .to_std()
                    .unwrap_or(config.sync_interval);
                recovery + jitter()
            } else {
                config.sync_interval
            };
            tokio::time::sleep(sleep).await;
        }
        info!("status sync stopped");
    }

    /// One reconcile pass. Public so tests can drive time explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`super::WorkerError`] on store failure; the caller logs and
    /// retries next tick.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, config: &EngineConfig, now: DateTime<Utc>) -> Result<()> {
        let rows = self.ctx.store.list_in_transfer(SYNC_BATCH_SIZE).await?;

        for row in rows {
            if self.ctx.breaker.is_open(now) {
                debug!("breaker open, aborting sync batch");
                break;
            }
            self.sync_row(&row, config, now).await?;
        }

        Ok(())
    }

    async fn sync_row(
        &self,
        row: &Download,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(external_ref) = row.external_ref.as_deref() else {
            warn!(id = row.id, "in-transfer row has no external ref");
            return Ok(());
        };

        match self.ctx.downloader.status(external_ref).await {
            Ok(update) => self.apply_update(row, &update, config, now).await,
            Err(PortError::NotFound) => {
                // The downloader no longer knows the ref it issued.
                self.fail_transfer(
                    row,
                    ErrorCode::LostByDownloader,
                    "transfer no longer known to downloader",
                    config,
                    now,
                )
                .await
            }
            Err(err) => {
                // Transport-class failures already fed the breaker inside
                // the guarded port; nothing to persist for this row.
                debug!(id = row.id, error = %err, "status poll failed");
                Ok(())
            }
        }
    }

    async fn apply_update(
        &self,
        row: &Download,
        update: &TransferUpdate,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match update.state {
            TransferState::Queued => Ok(()),
            TransferState::Transferring => {
                let changed = row.status_str != "downloading"
                    || row.bytes_done != update.bytes_done
                    || row.bytes_total != update.bytes_total;
                if !changed {
                    return Ok(());
                }
                if let Some(updated) = self
                    .ctx
                    .store
                    .mark_transfer_progress(row.id, update.bytes_done, update.bytes_total, now)
                    .await?
                {
                    self.ctx.events.publish(DownloadChanged::from_row(&updated));
                }
                Ok(())
            }
            TransferState::Completed => {
                if update.bytes_done <= 0 {
                    return self
                        .fail_transfer(
                            row,
                            ErrorCode::InvalidFile,
                            "downloader reported completion with zero bytes",
                            config,
                            now,
                        )
                        .await;
                }
                self.complete_row(row, update, config, now).await
            }
            TransferState::Cancelled => {
                self.fail_transfer(
                    row,
                    ErrorCode::TransferFailed,
                    "transfer cancelled on downloader side",
                    config,
                    now,
                )
                .await
            }
            TransferState::Errored => {
                let message = update.error.as_deref().unwrap_or("transfer errored");
                let code = classify_transfer_error(message);
                self.fail_transfer(row, code, message, config, now).await
            }
        }
    }

    async fn complete_row(
        &self,
        row: &Download,
        update: &TransferUpdate,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let target_path = update
            .local_path
            .clone()
            .or_else(|| row.candidate_filename.clone())
            .unwrap_or_default();

        let Some(updated) = self
            .ctx
            .store
            .mark_completed(row.id, &target_path, update.bytes_done, update.bytes_total, now)
            .await?
        else {
            // Row left the in-transfer states while we were polling.
            return Ok(());
        };

        info!(id = row.id, target_path = %target_path, "download completed");
        self.ctx.events.publish(DownloadChanged::from_row(&updated));

        if config.auto_import {
            if let Err(err) = self
                .ctx
                .importer
                .import(&updated.track_id, Path::new(&target_path))
                .await
            {
                warn!(id = row.id, error = %err, "library import failed");
            }
        }
        Ok(())
    }

    /// Applies a transfer failure, charging the retry budget according to
    /// the code's retry class. Alternative-candidate failures come due
    /// immediately; wait-class failures follow the back-off schedule;
    /// terminal codes and spent budgets end the row.
    async fn fail_transfer(
        &self,
        row: &Download,
        code: ErrorCode,
        message: &str,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (retry_count, next_retry_at) = match code.retry_class() {
            RetryClass::Terminal => (row.retry_count, None),
            _ if !row.has_retry_budget() => (row.retry_count, None),
            RetryClass::Wait => {
                let charged = row.retry_count + 1;
                (charged, Some(now + config.backoff_for(charged)))
            }
            RetryClass::AlternativeCandidate => (row.retry_count + 1, Some(now)),
        };

        // Repeated per-source failures feed the blocklist so the next
        // dispatch pass avoids the same file.
        if code.retry_class() == RetryClass::AlternativeCandidate {
            if let (Some(peer), Some(filename)) =
                (row.candidate_peer.as_deref(), row.candidate_filename.as_deref())
            {
                self.ctx
                    .blocklist
                    .add(peer, Some(filename), message, None, now)
                    .await?;
            }
        }

        let Some(updated) = self
            .ctx
            .store
            .mark_transfer_failed(row.id, code, message, retry_count, next_retry_at, now)
            .await?
        else {
            return Ok(());
        };

        info!(
            id = row.id,
            code = %code,
            retry_count = updated.retry_count,
            scheduled = updated.next_retry_at.is_some(),
            "transfer failed"
        );
        self.ctx.events.publish(DownloadChanged::from_row(&updated));
        Ok(())
    }
}

fn jitter() -> StdDuration {
    let millis = rand::thread_rng().gen_range(0..=MAX_BREAKER_JITTER_MS);
    StdDuration::from_millis(millis)
}
