//! Retry scheduler: reactivates due failures and promotes due scheduled
//! rows, plus periodic housekeeping (blocklist expiry, optional retention
//! pruning).
//!
//! The scheduler never touches `retry_count`: it was charged when the
//! retry was scheduled. Terminal failures carry no `next_retry_at` and are
//! therefore never selected.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument};

use super::{EngineContext, Result, Shutdown};
use crate::events::DownloadChanged;
use crate::settings::EngineConfig;

/// Heartbeat name for this worker.
const WORKER_NAME: &str = "retry_scheduler";

/// Rows reactivated or promoted per tick.
const RETRY_BATCH_SIZE: i64 = 50;

/// Reactivates failed rows and promotes scheduled ones.
pub struct RetryScheduler {
    ctx: EngineContext,
}

impl RetryScheduler {
    /// Creates the scheduler over the shared context.
    #[must_use]
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Long-lived loop; exits when `shutdown` triggers.
    pub async fn run(self, shutdown: Arc<Shutdown>) {
        info!("retry scheduler started");
        while !shutdown.is_triggered() {
            let config = EngineConfig::load(self.ctx.settings.as_ref()).await;
            let now = Utc::now();
            self.ctx.heartbeats.beat(WORKER_NAME, now);

            if let Err(err) = self.tick(&config, now).await {
                error!(error = %err, "retry scheduler tick failed");
            }

            tokio::time::sleep(config.retry_interval).await;
        }
        info!("retry scheduler stopped");
    }

    /// One scheduler pass. Public so tests can drive time explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`super::WorkerError`] on store failure; the caller logs and
    /// retries next tick.
    #[instrument(skip(self, config))]
    pub async fn tick(&self, config: &EngineConfig, now: DateTime<Utc>) -> Result<()> {
        // Scheduled rows whose start has arrived re-enter the queue.
        for row in self.ctx.store.due_scheduled(now, RETRY_BATCH_SIZE).await? {
            if let Some(promoted) = self.ctx.store.promote_scheduled(row.id, now).await? {
                info!(id = promoted.id, "scheduled download released");
                self.ctx.events.publish(DownloadChanged::from_row(&promoted));
            }
        }

        // Failed rows whose back-off has elapsed go back to dispatch.
        for row in self.ctx.store.due_retries(now, RETRY_BATCH_SIZE).await? {
            if let Some(reactivated) = self.ctx.store.reactivate(row.id, now).await? {
                info!(
                    id = reactivated.id,
                    retry_count = reactivated.retry_count,
                    "failed download reactivated for retry"
                );
                self.ctx
                    .events
                    .publish(DownloadChanged::from_row(&reactivated));
            }
        }

        let purged = self.ctx.blocklist.purge_expired(now).await?;
        if purged > 0 {
            debug!(purged, "expired blocklist entries purged");
        }

        if config.retention_days > 0 {
            let cutoff = now - Duration::days(config.retention_days);
            let pruned = self.ctx.store.prune_terminal_older_than(cutoff).await?;
            if pruned > 0 {
                info!(pruned, "terminal downloads pruned by retention policy");
            }
        }

        Ok(())
    }
}
