//! Ingestion orchestrator
//!
//! Drives classified files through the reader and the bulk loader, one record
//! type at a time in registry order. Every type's table is recreated at the
//! start of its turn, with or without files, so a run always leaves a full
//! refresh behind. Each type moves through [`TypeState::Pending`],
//! [`TypeState::ProcessingFile`] and [`TypeState::Done`]; unreadable files and
//! failed batches are logged and counted, never raised. Only losing the target
//! store or the source directory stops a run.
//!
//! Each type runs as its own tokio task and reads its files on the blocking
//! pool. With `type_concurrency > 1` up to that many tasks run at once;
//! reports still come back in registry order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use cnpj_common::retry::RetryPolicy;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{scan_directory, Classification};
use crate::error::Result;
use crate::loader::{BatchOutcome, BulkLoader, TableSink};
use crate::reader::{ChunkedReader, ReaderStats};
use crate::schema::RecordType;

/// Knobs of the load stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSettings {
    pub chunk_size: usize,
    pub type_concurrency: usize,
    pub batch_retry: RetryPolicy,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            chunk_size: crate::reader::DEFAULT_CHUNK_SIZE,
            type_concurrency: 1,
            batch_retry: RetryPolicy::none(),
        }
    }
}

/// State of one run: the target store, the settings and the run id
///
/// Per-type counters are not kept here; they are returned by each type's
/// processing.
pub struct RunContext {
    pub run_id: Uuid,
    pub sink: Arc<dyn TableSink>,
    pub settings: LoadSettings,
}

impl RunContext {
    pub fn new(sink: Arc<dyn TableSink>, settings: LoadSettings) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            sink,
            settings,
        }
    }
}

/// Progress of one record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "file", rename_all = "snake_case")]
pub enum TypeState {
    Pending,
    /// Index into the type's file list
    ProcessingFile(usize),
    Done,
}

/// Outcome of loading one record type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeReport {
    pub record_type: RecordType,
    pub state: TypeState,
    pub files_matched: usize,
    pub files_processed: usize,
    pub failed_files: Vec<String>,
    pub rows_loaded: u64,
    pub batches_loaded: u64,
    pub batches_failed: u64,
    pub lines: ReaderStats,
    pub elapsed_secs: f64,
}

impl TypeReport {
    fn pending(record_type: RecordType, files_matched: usize) -> Self {
        Self {
            record_type,
            state: TypeState::Pending,
            files_matched,
            files_processed: 0,
            failed_files: Vec::new(),
            rows_loaded: 0,
            batches_loaded: 0,
            batches_failed: 0,
            lines: ReaderStats::default(),
            elapsed_secs: 0.0,
        }
    }

    /// Whether any file matched the type
    pub fn was_loaded(&self) -> bool {
        self.files_matched > 0
    }
}

/// Terminal summary of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub types: Vec<TypeReport>,
    pub unclassified: Vec<String>,
    pub indexes_created: Vec<String>,
    pub index_failures: Vec<String>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn rows_loaded(&self) -> u64 {
        self.types.iter().map(|t| t.rows_loaded).sum()
    }

    pub fn batches_failed(&self) -> u64 {
        self.types.iter().map(|t| t.batches_failed).sum()
    }

    pub fn failed_files(&self) -> Vec<&str> {
        self.types
            .iter()
            .flat_map(|t| t.failed_files.iter().map(String::as_str))
            .collect()
    }

    pub fn report(&self, record_type: RecordType) -> Option<&TypeReport> {
        self.types.iter().find(|t| t.record_type == record_type)
    }

    /// Log the per-type table and the run totals
    pub fn log(&self) {
        for t in &self.types {
            if !t.was_loaded() {
                warn!(record_type = %t.record_type, "No files, table recreated empty");
                continue;
            }
            info!(
                record_type = %t.record_type,
                files = t.files_processed,
                failed_files = t.failed_files.len(),
                rows = t.rows_loaded,
                batches = t.batches_loaded,
                failed_batches = t.batches_failed,
                repaired_lines = t.lines.repaired(),
                dropped_lines = t.lines.dropped,
                suspect_keys = t.lines.suspect_keys,
                elapsed_secs = t.elapsed_secs,
                "Record type summary"
            );
        }
        for file in self.failed_files() {
            warn!(file, "File could not be read");
        }
        for file in &self.unclassified {
            warn!(file = %file, "File was not classified");
        }
        info!(
            run_id = %self.run_id,
            rows = self.rows_loaded(),
            failed_batches = self.batches_failed(),
            elapsed_secs = self.elapsed_secs,
            "Ingestion finished"
        );
    }
}

pub struct Orchestrator {
    ctx: RunContext,
}

impl Orchestrator {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    /// Scan, classify and load everything below `root`, then build indexes
    pub async fn run(&self, root: &Path) -> Result<RunSummary> {
        let span = info_span!("ingest", run_id = %self.ctx.run_id);
        async {
            let classification = scan_directory(root)?;
            classification.report();
            self.ingest(root, &classification).await
        }
        .instrument(span)
        .await
    }

    /// Load the classified files below `root`
    pub async fn ingest(&self, root: &Path, classification: &Classification) -> Result<RunSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let concurrency = self.ctx.settings.type_concurrency.max(1);

        info!(
            files = classification.classified_count(),
            unclassified = classification.unclassified.len(),
            type_concurrency = concurrency,
            "Starting load"
        );

        let types: Vec<TypeReport> = stream::iter(RecordType::ALL)
            .map(|record_type| {
                let load = TypeLoad {
                    sink: Arc::clone(&self.ctx.sink),
                    settings: self.ctx.settings,
                    root: root.to_path_buf(),
                    record_type,
                    files: classification.files_for(record_type).to_vec(),
                };
                tokio::spawn(load.run().in_current_span())
            })
            .buffered(concurrency)
            .map(flatten_join)
            .try_collect()
            .await?;

        let (indexes_created, index_failures) = self.create_indexes(&types).await;

        Ok(RunSummary {
            run_id: self.ctx.run_id,
            started_at,
            types,
            unclassified: classification.unclassified.clone(),
            indexes_created,
            index_failures,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    /// Index every key table; failures are warnings
    async fn create_indexes(&self, types: &[TypeReport]) -> (Vec<String>, Vec<String>) {
        let mut created = Vec::new();
        let mut failed = Vec::new();

        for report in types {
            let schema = report.record_type.schema();
            if schema.key_column().is_none() {
                continue;
            }
            match self.ctx.sink.create_key_index(schema).await {
                Ok(()) => created.push(schema.table.to_string()),
                Err(e) => {
                    warn!(table = schema.table, error = %e, "Index creation failed");
                    failed.push(schema.table.to_string());
                },
            }
        }

        (created, failed)
    }
}

fn flatten_join(joined: std::result::Result<Result<TypeReport>, JoinError>) -> Result<TypeReport> {
    joined?
}

/// Everything one record type's task owns
struct TypeLoad {
    sink: Arc<dyn TableSink>,
    settings: LoadSettings,
    root: PathBuf,
    record_type: RecordType,
    files: Vec<String>,
}

impl TypeLoad {
    /// Recreate the table of the record type and load its files in order
    async fn run(self) -> Result<TypeReport> {
        let record_type = self.record_type;
        let files = &self.files;
        let mut report = TypeReport::pending(record_type, files.len());
        let started = Instant::now();
        let schema = record_type.schema();

        self.sink.recreate_table(schema).await?;
        if files.is_empty() {
            warn!(%record_type, "No files matched, table left empty");
            report.state = TypeState::Done;
            report.elapsed_secs = started.elapsed().as_secs_f64();
            return Ok(report);
        }
        info!(%record_type, files = files.len(), "Loading record type");

        let loader = BulkLoader::with_retry(self.sink.as_ref(), self.settings.batch_retry);

        for (index, file) in files.iter().enumerate() {
            report.state = TypeState::ProcessingFile(index);
            info!(
                %record_type,
                file = %file,
                position = index + 1,
                of = files.len(),
                "Processing file"
            );

            let path = self.root.join(file);
            let chunk_size = self.settings.chunk_size;
            let mut reader = match ChunkedReader::open(&path, record_type, chunk_size) {
                Ok(reader) => reader,
                Err(e) => {
                    error!(%record_type, file = %file, error = %e, "Skipping unreadable file");
                    report.failed_files.push(file.clone());
                    continue;
                },
            };

            let mut stats = ReaderStats::default();
            let mut read_failed = false;
            loop {
                let (returned, next) = match reader.next_blocking().await {
                    Ok(pulled) => pulled,
                    Err(e) => {
                        error!(%record_type, file = %file, error = %e, "Reader task failed");
                        read_failed = true;
                        break;
                    },
                };
                reader = returned;
                stats = *reader.stats();

                let batch = match next {
                    None => break,
                    Some(Ok(batch)) => batch,
                    Some(Err(e)) => {
                        error!(%record_type, file = %file, error = %e, "Stopped reading file");
                        read_failed = true;
                        break;
                    },
                };

                match loader.load_batch(schema, file, &batch).await {
                    BatchOutcome::Loaded { rows } => {
                        report.rows_loaded += rows;
                        report.batches_loaded += 1;
                    },
                    BatchOutcome::Failed { .. } => report.batches_failed += 1,
                }
            }

            report.lines.merge(&stats);
            if read_failed {
                report.failed_files.push(file.clone());
            } else {
                report.files_processed += 1;
            }
        }

        report.state = TypeState::Done;
        report.elapsed_secs = started.elapsed().as_secs_f64();
        info!(
            %record_type,
            rows = report.rows_loaded,
            failed_batches = report.batches_failed,
            elapsed_secs = report.elapsed_secs,
            "Record type done"
        );

        Ok(report)
    }
}
