//! SQLite access for the orchestration engine.
//!
//! One database holds the job table, blocklist, settings, and track
//! mirror. Four workers and the API pool all hit it concurrently, so the
//! connection is tuned for that pattern:
//!
//! - WAL journaling, so list/health/SSE reads never block a worker that
//!   is mid `claim_next`/`release` write.
//! - A busy timeout, so two workers whose claim statements collide on the
//!   write lock queue up instead of surfacing `SQLITE_BUSY` to a tick.
//!
//! Migrations are embedded and run on open; a restarted process picks up
//! its durable jobs with no extra ceremony. Tests use the in-memory
//! constructor and get the identical schema.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Pool size. SQLite serializes writers anyway; a few connections are
/// enough to keep API reads flowing while a worker holds the write lock.
const POOL_SIZE: u32 = 5;

/// How long a connection waits on the write lock before giving up.
/// Claim/release statements from different workers routinely collide;
/// they should queue, not fail a tick.
const WRITE_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Failures opening or migrating the database.
#[derive(Error, Debug)]
pub enum DbError {
    /// The database file could not be opened or the pool not built.
    #[error("could not open downloads database: {0}")]
    Open(#[from] sqlx::Error),

    /// The embedded schema migrations failed to apply.
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Shared handle to the engine's SQLite pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path`, applies WAL +
    /// busy-timeout tuning, and runs any pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] when the pool cannot be built, or
    /// [`DbError::Migrate`] when the embedded migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(WRITE_LOCK_WAIT);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens a throwaway in-memory database with the full schema. WAL is
    /// pointless without a file, so the single connection runs with
    /// default journaling.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] or [`DbError::Migrate`] as with
    /// [`Database::new`].
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool, for executing queries.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drains and closes the pool. The handle is unusable afterwards.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
