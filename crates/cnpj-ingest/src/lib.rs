//! CNPJ Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads the Brazilian federal revenue CNPJ open data release into PostgreSQL.
//!
//! # Overview
//!
//! - **Schema registry** ([`schema`]): the ten record types and their columns
//! - **Classifier** ([`classifier`]): maps extracted file names to record types
//! - **Sanitizer** ([`sanitizer`]): repairs malformed `;`-delimited lines
//! - **Reader** ([`reader`]): streams a file as bounded batches of rows
//! - **Loader** ([`loader`], [`database`]): appends batches to the target tables
//! - **Orchestrator** ([`orchestrator`]): drives a full load and reports on it
//! - **Snapshot source** ([`download`], [`extract`]): fetches and unpacks the
//!   latest monthly release
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cnpj_ingest::config::IngestConfig;
//! use cnpj_ingest::database::{create_pool, PgLoader};
//! use cnpj_ingest::orchestrator::{LoadSettings, Orchestrator, RunContext};
//!
//! # async fn example() -> cnpj_ingest::Result<()> {
//! let config = IngestConfig::from_env()?;
//! let pool = create_pool(&config.database).await?;
//! let sink = Arc::new(PgLoader::new(pool, config.insert_batch_size));
//!
//! let orchestrator = Orchestrator::new(RunContext::new(sink, LoadSettings::default()));
//! let summary = orchestrator.run(&config.extract_dir).await?;
//! summary.log();
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod database;
pub mod download;
pub mod error;
pub mod extract;
pub mod loader;
pub mod orchestrator;
pub mod reader;
pub mod sanitizer;
pub mod schema;

pub use error::{IngestError, Result};
pub use schema::{RecordType, Row, Schema};
