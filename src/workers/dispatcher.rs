//! Dispatcher: promotes `waiting` rows to `pending` via a provider search.
//!
//! Each tick reclaims stale claims, takes the highest-priority `waiting`
//! row, searches the downloader for it, ranks the hits against the active
//! quality profile and blocklist, and persists the chosen candidate.
//! Candidate-less outcomes charge the retry budget and schedule a back-off
//! retry; downloader unavailability leaves the row untouched for a later
//! tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use super::{EngineContext, Result, Shutdown};
use crate::events::DownloadChanged;
use crate::quality::{candidate_from_hit, score_hit};
use crate::settings::EngineConfig;
use crate::store::{Download, DownloadStatus, ErrorCode, StoreError};

/// Heartbeat name and claim owner for this worker.
const WORKER_NAME: &str = "dispatcher";

/// Promotes `waiting` rows by searching and selecting candidates.
pub struct DispatcherWorker {
    ctx: EngineContext,
}

impl DispatcherWorker {
    /// Creates the worker over the shared context.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Long-lived loop; exits when `shutdown` triggers.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!("dispatcher started");
        while !shutdown.is_triggered() {
            let config = EngineConfig::load(self.ctx.settings.as_ref()).await;
            let now = Utc::now();
            self.ctx.heartbeats.beat(WORKER_NAME, now);

            if let Err(err) = self.tick(&config, now).await {
                // Losing a claim mid-tick (user cancel, stale reclaim) is a
                // benign race; anything else is a real tick failure.
                if matches!(err, super::WorkerError::Store(StoreError::LockLost { .. })) {
                    debug!(error = %err, "claim lost mid-tick");
                } else {
                    error!(error = %err, "dispatcher tick failed");
                }
            }

            tokio::time::sleep(config.dispatch_interval).await;
        }
        info!("dispatcher stopped");
    }

    /// One dispatch pass. Public so tests can drive time explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`super::WorkerError`] on store or metadata failure; the
    /// caller logs and retries next tick.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, config: &EngineConfig, now: DateTime<Utc>) -> Result<()> {
        let reclaimed = self
            .ctx
            .store
            .reclaim_stale(now, config.lock_timeout)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed stale claims");
        }

        if self.ctx.store.count_active().await? >= config.max_concurrent {
            debug!("active set at capacity, skipping dispatch");
            return Ok(());
        }

        let Some(row) = self
            .ctx
            .store
            .claim_next(
                WORKER_NAME,
                &[DownloadStatus::Waiting],
                now,
                config.lock_timeout,
            )
            .await?
        else {
            return Ok(());
        };

        self.dispatch_row(row, config, now).await
    }

    async fn dispatch_row(
        &self,
        row: Download,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(info) = self.ctx.tracks.track(&row.track_id).await? else {
            warn!(track_id = %row.track_id, "track metadata missing");
            self.fail_dispatch(&row, config, now, "track metadata missing")
                .await?;
            return Ok(());
        };

        let query = info.search_query();
        let hits = match self.ctx.downloader.search(&query).await {
            Ok(hits) => hits,
            Err(err) => {
                // Downloader trouble is not this row's fault: leave it
                // waiting and let the breaker pace the next attempt.
                debug!(error = %err, "search unavailable, releasing row unchanged");
                self.ctx.store.release_unchanged(row.id, WORKER_NAME, now).await?;
                return Ok(());
            }
        };

        if hits.is_empty() {
            self.fail_dispatch(&row, config, now, &format!("no results for '{query}'"))
                .await?;
            return Ok(());
        }

        let mut scored = Vec::new();
        for hit in &hits {
            let blocked = self
                .ctx
                .blocklist
                .is_blocked(&hit.peer, &hit.filename, now)
                .await?;
            if let Some(score) = score_hit(hit, &config.quality_profile, blocked) {
                scored.push((score, hit));
            }
        }
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let Some((score, best)) = scored.first() else {
            self.fail_dispatch(
                &row,
                config,
                now,
                &format!("no acceptable candidate among {} hits for '{query}'", hits.len()),
            )
            .await?;
            return Ok(());
        };

        let per_peer = self.ctx.store.count_active_for_peer(&best.peer).await?;
        if per_peer >= config.max_concurrent_per_peer {
            debug!(peer = %best.peer, "per-peer cap reached, deferring promotion");
            self.ctx.store.release_unchanged(row.id, WORKER_NAME, now).await?;
            return Ok(());
        }

        let candidate = candidate_from_hit(best);
        let updated = self
            .ctx
            .store
            .release_to_pending(row.id, WORKER_NAME, &candidate, now)
            .await?;
        info!(
            id = row.id,
            peer = %candidate.peer,
            score,
            "candidate selected"
        );
        self.ctx.events.publish(DownloadChanged::from_row(&updated));
        Ok(())
    }

    /// Candidate-less outcome: charge the budget and schedule a back-off
    /// retry, or fail terminally once the budget is spent.
    async fn fail_dispatch(
        &self,
        row: &Download,
        config: &EngineConfig,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<()> {
        let updated = if row.has_retry_budget() {
            let charged = row.retry_count + 1;
            let next_retry_at = now + config.backoff_for(charged);
            self.ctx
                .store
                .release_failed(
                    row.id,
                    WORKER_NAME,
                    ErrorCode::NoResults,
                    message,
                    charged,
                    Some(next_retry_at),
                    now,
                )
                .await?
        } else {
            self.ctx
                .store
                .release_failed(
                    row.id,
                    WORKER_NAME,
                    ErrorCode::NoResults,
                    message,
                    row.retry_count,
                    None,
                    now,
                )
                .await?
        };

        info!(
            id = row.id,
            retry_count = updated.retry_count,
            scheduled = updated.next_retry_at.is_some(),
            "dispatch found no candidate"
        );
        self.ctx.events.publish(DownloadChanged::from_row(&updated));
        Ok(())
    }
}
