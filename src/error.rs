//! Error types shared by the ingestion core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// Top-level error for library operations.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("recovery store error: {0}")]
    Recovery(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("sink {sink} failed: {message}")]
    Sink { sink: String, message: String },
}

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        IngestError::Recovery(e.to_string())
    }
}

/// Returned once every attempt for a source has failed.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("all {attempts} attempts failed for source {source_id}: {last_error}")]
    Exhausted {
        source_id: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to open resource for {key}: {message}")]
    Open { key: String, message: String },

    #[error("failed to append to resource for {key}: {message}")]
    Append { key: String, message: String },

    #[error("resource cache is shut down")]
    ShutDown,
}
