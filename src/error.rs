// src/error.rs

use thiserror::Error;

/// Core error types for Pinwatch
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Registry communication failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Registry data could not be understood
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Requested entity or parser does not exist
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Entity already exists
    #[error("Conflict: {0}")]
    ConflictError(String),

    /// Every event of a synchronization run failed
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),
}

impl Error {
    /// Whether this error should abort a synchronization run instead of
    /// being isolated to the event that raised it
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Io(_) | Error::InitError(_) | Error::DatabaseNotFound(_)
        )
    }
}

/// Result type alias using Pinwatch's Error type
pub type Result<T> = std::result::Result<T, Error>;
