//! Blocklist persistence: peers and files excluded from candidate selection.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row};
use tracing::instrument;

use super::Result;
use crate::db::Database;

/// A blocklist row. A `NULL` filename blocks every file from the peer.
#[derive(Debug, Clone, FromRow)]
pub struct BlocklistEntry {
    /// Unique identifier.
    pub id: i64,
    /// Blocked peer.
    pub peer: String,
    /// Blocked filename, or None for a whole-peer block.
    pub filename: Option<String>,
    /// Why the entry was added.
    pub reason: String,
    /// How many failures have been attributed to this source.
    pub failure_count: i64,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry stops matching; None means never.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Blocklist operations, backed by the `download_blocklist` table.
///
/// Expired entries are ignored by queries but not eagerly deleted;
/// [`Blocklist::purge_expired`] removes them lazily.
#[derive(Debug, Clone)]
pub struct Blocklist {
    db: Database,
}

impl Blocklist {
    /// Creates a blocklist over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds an entry, or bumps `failure_count` if one already exists for
    /// the `(peer, filename)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the upsert fails.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn add(
        &self,
        peer: &str,
        filename: Option<&str>,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"INSERT INTO download_blocklist (peer, filename, reason, failure_count, created_at, expires_at)
              VALUES (?, ?, ?, 1, ?, ?)
              ON CONFLICT (peer, filename) DO UPDATE SET
                  failure_count = failure_count + 1,
                  reason = excluded.reason,
                  expires_at = excluded.expires_at",
        )
        .bind(peer)
        .bind(filename)
        .bind(reason)
        .bind(now)
        .bind(expires_at)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Checks whether `(peer, filename)` is currently blocked.
    ///
    /// A query matches when the peer equals and either the entry has no
    /// filename (whole peer blocked) or the filename matches exactly.
    /// Expired entries never match.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn is_blocked(
        &self,
        peer: &str,
        filename: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"SELECT COUNT(*) as count FROM download_blocklist
              WHERE peer = ?
                AND (filename IS NULL OR filename = ?)
                AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(peer)
        .bind(filename)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get::<i64, _>("count") > 0)
    }

    /// Increments the failure counter for an existing `(peer, filename)`
    /// entry. No-op if no entry exists.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the update fails.
    #[instrument(skip(self), fields(peer = %peer))]
    pub async fn increment_failure(&self, peer: &str, filename: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r"UPDATE download_blocklist
              SET failure_count = failure_count + 1
              WHERE peer = ? AND filename IS ?",
        )
        .bind(peer)
        .bind(filename)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes entries whose expiry has passed. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"DELETE FROM download_blocklist
              WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Lists all entries, newest first. For diagnostics.
    ///
    /// # Errors
    ///
    /// Returns [`super::StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<BlocklistEntry>> {
        let entries = sqlx::query_as::<_, BlocklistEntry>(
            r"SELECT * FROM download_blocklist ORDER BY created_at DESC",
        )
        .fetch_all(self.db.pool())
        .await?;

        Ok(entries)
    }
}
