//! Live-observed engine tunables from the key/value settings store.
//!
//! Workers call [`EngineConfig::load`] at the top of every tick instead of
//! caching values across ticks, so settings changes apply without a
//! restart. Unparseable or missing values fall back to their defaults.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use sqlx::Row;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::breaker::{BreakerConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_MS};
use crate::db::Database;
use crate::quality::QualityProfile;

/// Errors from the settings store.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// An underlying database operation failed.
    #[error("settings store error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Read access to the key/value settings store.
#[async_trait]
pub trait SettingsReader: Send + Sync {
    /// Returns the raw value for a key, if set.
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// SQLite-backed settings store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Sets a key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::Database`] if the upsert fails.
    #[instrument(skip(self, value), fields(key = %key))]
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO settings (key, value, updated_at)
              VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
              ON CONFLICT (key) DO UPDATE SET
                  value = excluded.value,
                  updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SettingsReader for SettingsStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(r"SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|r| r.get("value")))
    }
}

/// In-memory settings for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl InMemorySettings {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key.
    ///
    /// # Panics
    ///
    /// Never panics; a poisoned lock is recovered.
    pub fn set(&self, key: &str, value: &str) {
        let mut values = match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        values.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl SettingsReader for InMemorySettings {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let values = match self.values.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(values.get(key).cloned())
    }
}

/// Typed snapshot of every engine tunable, with defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on rows simultaneously in `pending`/`queued`/`downloading`.
    pub max_concurrent: i64,
    /// Per-peer cap within the active set.
    pub max_concurrent_per_peer: i64,
    /// Cap on non-terminal rows.
    pub max_queue_size: i64,
    /// Status-sync worker cadence.
    pub sync_interval: StdDuration,
    /// Dispatcher and enqueue worker cadence.
    pub dispatch_interval: StdDuration,
    /// Retry-scheduler cadence.
    pub retry_interval: StdDuration,
    /// Circuit-breaker tunables.
    pub breaker: BreakerConfig,
    /// Back-off schedule; the i-th retry (1-indexed) waits
    /// `retry_backoff[min(i-1, len-1)]`.
    pub retry_backoff: Vec<Duration>,
    /// Claims older than this are abandoned and reclaimable.
    pub lock_timeout: Duration,
    /// Hand finished files to the library importer.
    pub auto_import: bool,
    /// Prune terminal rows older than this many days; 0 disables.
    pub retention_days: i64,
    /// Active quality profile.
    pub quality_profile: QualityProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_concurrent_per_peer: 1,
            max_queue_size: 100,
            sync_interval: StdDuration::from_millis(2000),
            dispatch_interval: StdDuration::from_millis(1000),
            retry_interval: StdDuration::from_millis(5000),
            breaker: BreakerConfig {
                failure_threshold: DEFAULT_FAILURE_THRESHOLD,
                recovery: Duration::milliseconds(DEFAULT_RECOVERY_MS),
            },
            retry_backoff: vec![
                Duration::seconds(60),
                Duration::seconds(300),
                Duration::seconds(900),
            ],
            lock_timeout: Duration::minutes(5),
            auto_import: true,
            retention_days: 0,
            quality_profile: QualityProfile::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a snapshot from the settings store.
    ///
    /// Missing or unparseable keys fall back to defaults; a store error
    /// falls back to the full default config (logged, never fatal), so a
    /// worker tick can always proceed.
    pub async fn load(reader: &dyn SettingsReader) -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent: read_i64(reader, "download.max_concurrent", defaults.max_concurrent)
                .await,
            max_concurrent_per_peer: read_i64(
                reader,
                "download.max_concurrent_per_peer",
                defaults.max_concurrent_per_peer,
            )
            .await,
            max_queue_size: read_i64(reader, "download.max_queue_size", defaults.max_queue_size)
                .await,
            sync_interval: read_millis(reader, "download.sync_interval_ms", defaults.sync_interval)
                .await,
            dispatch_interval: read_millis(
                reader,
                "download.dispatch_interval_ms",
                defaults.dispatch_interval,
            )
            .await,
            retry_interval: read_millis(
                reader,
                "download.retry_interval_ms",
                defaults.retry_interval,
            )
            .await,
            breaker: BreakerConfig {
                failure_threshold: u32::try_from(
                    read_i64(
                        reader,
                        "download.breaker_failure_threshold",
                        i64::from(defaults.breaker.failure_threshold),
                    )
                    .await,
                )
                .unwrap_or(defaults.breaker.failure_threshold),
                recovery: Duration::milliseconds(
                    read_i64(
                        reader,
                        "download.breaker_recovery_ms",
                        defaults.breaker.recovery.num_milliseconds(),
                    )
                    .await,
                ),
            },
            retry_backoff: read_backoff(reader, defaults.retry_backoff).await,
            lock_timeout: Duration::milliseconds(
                read_i64(
                    reader,
                    "download.lock_timeout_ms",
                    defaults.lock_timeout.num_milliseconds(),
                )
                .await,
            ),
            auto_import: read_bool(reader, "download.auto_import", defaults.auto_import).await,
            retention_days: read_i64(reader, "download.retention_days", defaults.retention_days)
                .await,
            quality_profile: read_profile(reader, defaults.quality_profile).await,
        }
    }

    /// Back-off delay for the i-th retry (1-indexed).
    #[must_use]
    pub fn backoff_for(&self, retry_number: i64) -> Duration {
        if self.retry_backoff.is_empty() {
            return Duration::seconds(60);
        }
        let index = usize::try_from((retry_number - 1).max(0)).unwrap_or(0);
        self.retry_backoff[index.min(self.retry_backoff.len() - 1)]
    }
}

async fn read_raw(reader: &dyn SettingsReader, key: &str) -> Option<String> {
    match reader.get(key).await {
        Ok(value) => value,
        Err(err) => {
            warn!(key, error = %err, "settings read failed, using default");
            None
        }
    }
}

async fn read_i64(reader: &dyn SettingsReader, key: &str, default: i64) -> i64 {
    match read_raw(reader, key).await {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, raw = %raw, "unparseable integer setting, using default");
            default
        }),
        None => default,
    }
}

async fn read_bool(reader: &dyn SettingsReader, key: &str, default: bool) -> bool {
    match read_raw(reader, key).await {
        Some(raw) => matches!(raw.trim(), "true" | "1" | "yes"),
        None => default,
    }
}

async fn read_millis(
    reader: &dyn SettingsReader,
    key: &str,
    default: StdDuration,
) -> StdDuration {
    let millis = read_i64(reader, key, default.as_millis() as i64).await;
    StdDuration::from_millis(u64::try_from(millis).unwrap_or(default.as_millis() as u64))
}

async fn read_backoff(reader: &dyn SettingsReader, default: Vec<Duration>) -> Vec<Duration> {
    let Some(raw) = read_raw(reader, "download.retry_backoff_ms").await else {
        return default;
    };
    match serde_json::from_str::<Vec<i64>>(&raw) {
        Ok(millis) if !millis.is_empty() => {
            millis.into_iter().map(Duration::milliseconds).collect()
        }
        _ => {
            warn!(raw = %raw, "unparseable retry back-off setting, using default");
            default
        }
    }
}

async fn read_profile(reader: &dyn SettingsReader, default: QualityProfile) -> QualityProfile {
    let Some(raw) = read_raw(reader, "quality.profile").await else {
        return default;
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(error = %err, "unparseable quality profile, using default");
        default
    })
}
