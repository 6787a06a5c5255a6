//! Read access to the track metadata mirror.
//!
//! The engine only consumes track metadata: the dispatcher builds search
//! queries from it, and album enqueue expands an album into track ids. The
//! mirror table is populated by the provider sync collaborators.

use async_trait::async_trait;
use sqlx::{FromRow, Row};
use thiserror::Error;
use tracing::instrument;

use crate::db::Database;

/// Errors from metadata lookups.
#[derive(Error, Debug)]
pub enum TrackError {
    /// An underlying database operation failed.
    #[error("track metadata error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for metadata lookups.
pub type Result<T> = std::result::Result<T, TrackError>;

/// Metadata needed to search for a track.
#[derive(Debug, Clone, FromRow)]
pub struct TrackInfo {
    /// Track title.
    pub title: String,
    /// Primary artist.
    pub artist: String,
    /// Album title, when known.
    pub album: Option<String>,
}

impl TrackInfo {
    /// The provider search query for this track.
    #[must_use]
    pub fn search_query(&self) -> String {
        format!("{} {}", self.artist, self.title)
    }
}

/// Read-only metadata access consumed by the engine.
#[async_trait]
pub trait TrackReader: Send + Sync {
    /// Looks up a track by id.
    async fn track(&self, track_id: &str) -> Result<Option<TrackInfo>>;

    /// Expands an album into its track ids for the given source.
    async fn album_track_ids(&self, album_id: &str, source: &str) -> Result<Vec<String>>;
}

/// Metadata reader over the local `tracks` mirror table.
#[derive(Debug, Clone)]
pub struct SqliteTrackReader {
    db: Database,
}

impl SqliteTrackReader {
    /// Creates a reader over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TrackReader for SqliteTrackReader {
    #[instrument(skip(self), fields(track_id = %track_id))]
    async fn track(&self, track_id: &str) -> Result<Option<TrackInfo>> {
        let info = sqlx::query_as::<_, TrackInfo>(
            r"SELECT title, artist, album FROM tracks WHERE id = ?",
        )
        .bind(track_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(info)
    }

    #[instrument(skip(self), fields(album_id = %album_id, source = %source))]
    async fn album_track_ids(&self, album_id: &str, source: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"SELECT id FROM tracks WHERE album_id = ? AND source = ? ORDER BY id",
        )
        .bind(album_id)
        .bind(source)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seeded_reader() -> SqliteTrackReader {
        let db = Database::new_in_memory().await.unwrap();
        sqlx::query(
            r"INSERT INTO tracks (id, title, artist, album, album_id, source) VALUES
              ('T1', 'Song1', 'Artist1', 'Album1', 'A1', 'spotify'),
              ('T2', 'Song2', 'Artist1', 'Album1', 'A1', 'spotify'),
              ('T3', 'Other', 'Artist2', NULL, NULL, 'deezer')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        SqliteTrackReader::new(db)
    }

    #[tokio::test]
    async fn test_track_lookup() {
        let reader = seeded_reader().await;
        let info = reader.track("T1").await.unwrap().unwrap();
        assert_eq!(info.title, "Song1");
        assert_eq!(info.artist, "Artist1");
        assert_eq!(info.album.as_deref(), Some("Album1"));
    }

    #[tokio::test]
    async fn test_track_lookup_missing() {
        let reader = seeded_reader().await;
        assert!(reader.track("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_search_query_format() {
        let reader = seeded_reader().await;
        let info = reader.track("T1").await.unwrap().unwrap();
        assert_eq!(info.search_query(), "Artist1 Song1");
    }

    #[tokio::test]
    async fn test_album_expansion_scoped_by_source() {
        let reader = seeded_reader().await;
        let ids = reader.album_track_ids("A1", "spotify").await.unwrap();
        assert_eq!(ids, vec!["T1", "T2"]);

        let none = reader.album_track_ids("A1", "deezer").await.unwrap();
        assert!(none.is_empty());
    }
}
