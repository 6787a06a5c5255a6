//! Hand-off seam for finished files.
//!
//! When `download.auto_import` is on, the status-sync worker passes each
//! completed file to this collaborator. The real implementation lives with
//! the library/file-naming services; the engine ships a logging no-op.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument};

/// Import hand-off failure. Imports are best-effort; callers log and move
/// on.
#[derive(Debug, Error)]
#[error("library import failed: {0}")]
pub struct ImportError(pub String);

/// Collaborator that takes ownership of finished files.
#[async_trait]
pub trait LibraryImporter: Send + Sync {
    /// Hands a finished file to the library.
    async fn import(&self, track_id: &str, path: &Path) -> Result<(), ImportError>;
}

/// Default importer: records the hand-off and does nothing else.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyImporter;

#[async_trait]
impl LibraryImporter for LogOnlyImporter {
    #[instrument(skip(self), fields(track_id = %track_id, path = %path.display()))]
    async fn import(&self, track_id: &str, path: &Path) -> Result<(), ImportError> {
        info!("completed file ready for library import");
        Ok(())
    }
}
