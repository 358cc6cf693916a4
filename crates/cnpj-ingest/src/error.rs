//! Error types for the ingestion pipeline

use std::path::PathBuf;

use thiserror::Error;

use crate::schema::RecordType;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised while discovering, extracting, reading or loading data
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Delimited text error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Common(#[from] cnpj_common::CnpjError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot read source directory {path}: {source}")]
    SourceDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare table for {record_type}: {source}")]
    TablePreparation {
        record_type: RecordType,
        #[source]
        source: sqlx::Error,
    },

    #[error("Snapshot listing error: {0}")]
    Listing(String),

    #[error("Row has {actual} fields, {record_type} expects {expected}")]
    Arity {
        record_type: RecordType,
        expected: usize,
        actual: usize,
    },
}

impl IngestError {
    /// Whether this error must stop the whole run
    ///
    /// Only losing the database (connection or table preparation) and losing
    /// the source directory are fatal; everything else is isolated to a file
    /// or a batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::SourceDirectory { .. } | IngestError::TablePreparation { .. }
        )
    }
}
