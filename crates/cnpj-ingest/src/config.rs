//! Ingestion configuration
//!
//! Settings come from the environment (a `.env` file is loaded first by the
//! binary). Unset variables take their defaults; malformed ones are errors.

use std::path::PathBuf;
use std::time::Duration;

use cnpj_common::env::{parse_or, string_or};
use cnpj_common::retry::RetryPolicy;
use serde::Serialize;

use crate::database::DbConfig;
use crate::error::{IngestError, Result};
use crate::reader::DEFAULT_CHUNK_SIZE;

/// Public listing of the monthly CNPJ releases
pub const DEFAULT_BASE_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj/";

/// HTTP behaviour for discovery and download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 10,
            timeout_secs: 60,
        }
    }
}

impl HttpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_retries, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything one pipeline run needs
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Listing URL of the monthly snapshot directories
    pub base_url: String,
    /// Where archives are downloaded
    pub download_dir: PathBuf,
    /// Where archives are extracted and read from
    pub extract_dir: PathBuf,
    pub database: DbConfig,
    /// Rows per batch handed to the loader
    pub chunk_size: usize,
    /// Rows per `INSERT` statement
    pub insert_batch_size: usize,
    /// Extra attempts for a failed batch (0 = no retry)
    pub load_batch_retries: u32,
    /// Record types loaded at the same time
    pub type_concurrency: usize,
    pub http: HttpConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            download_dir: PathBuf::from("./data/zip"),
            extract_dir: PathBuf::from("./data/extracted"),
            database: DbConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            insert_batch_size: 1_000,
            load_batch_retries: 0,
            type_concurrency: 1,
            http: HttpConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            base_url: string_or("DADOS_RF_URL", &defaults.base_url),
            download_dir: PathBuf::from(string_or(
                "OUTPUT_FILES_PATH",
                &defaults.download_dir.to_string_lossy(),
            )),
            extract_dir: PathBuf::from(string_or(
                "EXTRACTED_FILES_PATH",
                &defaults.extract_dir.to_string_lossy(),
            )),
            database: DbConfig {
                url: string_or("DATABASE_URL", &defaults.database.url),
                max_connections: parse_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
                connect_timeout_secs: parse_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    defaults.database.connect_timeout_secs,
                )?,
            },
            chunk_size: parse_or("CHUNK_SIZE", defaults.chunk_size)?,
            insert_batch_size: parse_or("INSERT_BATCH_SIZE", defaults.insert_batch_size)?,
            load_batch_retries: parse_or("LOAD_BATCH_RETRIES", defaults.load_batch_retries)?,
            type_concurrency: parse_or("TYPE_CONCURRENCY", defaults.type_concurrency)?,
            http: HttpConfig {
                max_retries: parse_or("HTTP_MAX_RETRIES", defaults.http.max_retries)?,
                retry_delay_secs: parse_or(
                    "HTTP_RETRY_DELAY_SECS",
                    defaults.http.retry_delay_secs,
                )?,
                timeout_secs: parse_or("HTTP_TIMEOUT_SECS", defaults.http.timeout_secs)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(IngestError::Config("DADOS_RF_URL must not be empty".to_string()));
        }
        if self.database.url.trim().is_empty() {
            return Err(IngestError::Config("DATABASE_URL must not be empty".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(IngestError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(IngestError::Config("CHUNK_SIZE must be greater than 0".to_string()));
        }
        if self.insert_batch_size == 0 {
            return Err(IngestError::Config(
                "INSERT_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.type_concurrency == 0 {
            return Err(IngestError::Config(
                "TYPE_CONCURRENCY must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whole-batch retry policy; one attempt plus `load_batch_retries`
    pub fn batch_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.load_batch_retries.saturating_add(1),
            Duration::from_secs(self.http.retry_delay_secs),
        )
    }
}
