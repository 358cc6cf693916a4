//! Bulk loader
//!
//! [`TableSink`] is the seam between the pipeline and the target store: the
//! PostgreSQL implementation lives in [`crate::database`], tests use an
//! in-memory sink. [`BulkLoader`] appends one batch at a time and turns every
//! failure into a [`BatchOutcome::Failed`] so the caller can keep going.

use async_trait::async_trait;
use cnpj_common::retry::RetryPolicy;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::Result;
use crate::reader::Batch;
use crate::schema::{Row, Schema};

/// Target store operations used by the orchestrator
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Drop and recreate the table of `schema`
    async fn recreate_table(&self, schema: &'static Schema) -> Result<()>;

    /// Append `rows` atomically, returning the number of rows written
    async fn append(&self, schema: &'static Schema, rows: &[Row]) -> Result<u64>;

    /// Create the `cnpj_basico` lookup index for `schema` if it does not exist
    async fn create_key_index(&self, schema: &'static Schema) -> Result<()>;
}

/// Result of loading one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    Loaded { rows: u64 },
    Failed { error: String },
}

impl BatchOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, BatchOutcome::Loaded { .. })
    }
}

/// Appends batches through a [`TableSink`], isolating failures per batch
pub struct BulkLoader<'a> {
    sink: &'a dyn TableSink,
    retry: RetryPolicy,
}

impl<'a> BulkLoader<'a> {
    /// Loader without whole-batch retry
    pub fn new(sink: &'a dyn TableSink) -> Self {
        Self::with_retry(sink, RetryPolicy::none())
    }

    pub fn with_retry(sink: &'a dyn TableSink, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Append `batch` read from `file` to the table of `schema`
    ///
    /// Never fails: a batch that cannot be written after the configured
    /// attempts is logged and reported as lost.
    pub async fn load_batch(
        &self,
        schema: &'static Schema,
        file: &str,
        batch: &Batch,
    ) -> BatchOutcome {
        if batch.is_empty() {
            return BatchOutcome::Loaded { rows: 0 };
        }

        let result = self
            .retry
            .run("load batch", || self.sink.append(schema, &batch.rows))
            .await;

        match result {
            Ok(rows) => {
                debug!(
                    record_type = %schema.record_type,
                    file,
                    batch = batch.sequence,
                    rows,
                    "Batch loaded"
                );
                BatchOutcome::Loaded { rows }
            },
            Err(e) => {
                error!(
                    record_type = %schema.record_type,
                    file,
                    batch = batch.sequence,
                    rows = batch.len(),
                    error = %e,
                    "Batch failed to load, its rows are lost"
                );
                BatchOutcome::Failed {
                    error: e.to_string(),
                }
            },
        }
    }
}
