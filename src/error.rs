use rusqlite::Error as RusqliteError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into IndexerError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Source '{0}' not found")]
    SourceNotFound(String),

    #[error("Source with id '{0}' already exists")]
    SourceExists(String),

    #[error("Invalid source configuration: {0}")]
    InvalidSource(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Root path '{0}' is missing or unreadable")]
    RootUnavailable(PathBuf),

    // Internal signal from the directory walk; never escapes a scan
    #[error("Directory '{0}' is unreadable")]
    DirectoryUnreadable(PathBuf),

    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("An indexing run is already active for source '{0}'")]
    RunConflict(String),

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}

impl IndexerError {
    /// Infrastructure failures abort a run; everything else is either a
    /// configuration problem or a caller error.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            IndexerError::IoError(_)
                | IndexerError::DatabaseError(_)
                | IndexerError::PoolError(_)
                | IndexerError::RootUnavailable(_)
                | IndexerError::IndexUnavailable(_)
        )
    }
}
