//! Orchestrator scenarios against an in-memory table sink
//!
//! Run with:
//!
//! ```bash
//! cargo test -p cnpj-ingest --test orchestrator_test
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cnpj_ingest::classifier::Classification;
use cnpj_ingest::loader::TableSink;
use cnpj_ingest::orchestrator::{LoadSettings, Orchestrator, RunContext, TypeState};
use cnpj_ingest::{IngestError, RecordType, Result, Row, Schema};
use tempfile::TempDir;

/// Keeps appended rows per table; optionally fails chosen append calls
#[derive(Default)]
struct MemorySink {
    tables: Mutex<BTreeMap<&'static str, Vec<Row>>>,
    recreated: Mutex<Vec<&'static str>>,
    indexed: Mutex<Vec<&'static str>>,
    appends: Mutex<usize>,
    /// 1-based append calls that fail
    fail_appends: HashSet<usize>,
    fail_recreate: bool,
}

impl MemorySink {
    fn failing_appends(calls: &[usize]) -> Self {
        Self {
            fail_appends: calls.iter().copied().collect(),
            ..Default::default()
        }
    }

    fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl TableSink for MemorySink {
    async fn recreate_table(&self, schema: &'static Schema) -> Result<()> {
        if self.fail_recreate {
            return Err(IngestError::TablePreparation {
                record_type: schema.record_type,
                source: sqlx::Error::PoolClosed,
            });
        }
        self.tables.lock().unwrap().insert(schema.table, Vec::new());
        self.recreated.lock().unwrap().push(schema.table);
        Ok(())
    }

    async fn append(&self, schema: &'static Schema, rows: &[Row]) -> Result<u64> {
        let call = {
            let mut appends = self.appends.lock().unwrap();
            *appends += 1;
            *appends
        };
        if self.fail_appends.contains(&call) {
            return Err(IngestError::Database(sqlx::Error::PoolTimedOut));
        }
        self.tables
            .lock()
            .unwrap()
            .entry(schema.table)
            .or_default()
            .extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn create_key_index(&self, schema: &'static Schema) -> Result<()> {
        self.indexed.lock().unwrap().push(schema.table);
        Ok(())
    }
}

/// Holds each append of the listed tables on its thread until all of them
/// have started appending, or the timeout passes
struct RendezvousSink {
    inner: MemorySink,
    tables: Vec<&'static str>,
    arrived: Mutex<HashSet<&'static str>>,
    all_arrived: Condvar,
    /// Tables whose append saw every listed table arrive
    met: Mutex<Vec<&'static str>>,
}

impl RendezvousSink {
    fn new(tables: &[&'static str]) -> Self {
        Self {
            inner: MemorySink::default(),
            tables: tables.to_vec(),
            arrived: Mutex::new(HashSet::new()),
            all_arrived: Condvar::new(),
            met: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TableSink for RendezvousSink {
    async fn recreate_table(&self, schema: &'static Schema) -> Result<()> {
        self.inner.recreate_table(schema).await
    }

    async fn append(&self, schema: &'static Schema, rows: &[Row]) -> Result<u64> {
        if self.tables.contains(&schema.table) {
            let mut arrived = self.arrived.lock().unwrap();
            arrived.insert(schema.table);
            self.all_arrived.notify_all();
            let (arrived, _) = self
                .all_arrived
                .wait_timeout_while(arrived, Duration::from_secs(5), |a| {
                    a.len() < self.tables.len()
                })
                .unwrap();
            if arrived.len() == self.tables.len() {
                self.met.lock().unwrap().push(schema.table);
            }
        }
        self.inner.append(schema, rows).await
    }

    async fn create_key_index(&self, schema: &'static Schema) -> Result<()> {
        self.inner.create_key_index(schema).await
    }
}

fn all_tables() -> Vec<&'static str> {
    RecordType::ALL.iter().map(|t| t.table_name()).collect()
}

fn key_tables() -> Vec<String> {
    RecordType::ALL
        .iter()
        .map(|t| t.schema())
        .filter(|s| s.key_column().is_some())
        .map(|s| s.table.to_string())
        .collect()
}

fn orchestrator(sink: Arc<MemorySink>, chunk_size: usize) -> Orchestrator {
    let settings = LoadSettings {
        chunk_size,
        ..Default::default()
    };
    Orchestrator::new(RunContext::new(sink, settings))
}

fn write(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn reference_lines(count: usize) -> String {
    (0..count).map(|i| format!("{:04};Descricao {}\n", i, i)).collect()
}

const COMPANY_FILE: &str = "\
41273594;ACME LTDA;2062;49;1000,00;01;
41273595;ACME;COMERCIO;LTDA;2062;49;1000,00;01;
41273596;BETA SA;2054;10;0,00;05;
";

#[tokio::test]
async fn test_company_file_loads_three_rows() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "K3241.K03200Y0.D40113.EMPRECSV", COMPANY_FILE);

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 100_000).run(dir.path()).await.unwrap();

    let report = summary.report(RecordType::Empresa).unwrap();
    assert_eq!(report.state, TypeState::Done);
    assert_eq!(report.rows_loaded, 3);
    assert_eq!(report.batches_loaded, 1);
    assert_eq!(report.lines.merged, 1);

    let rows = sink.rows("empresa");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.len() == 7));
    assert_eq!(rows[1].get(1), Some("ACME COMERCIO LTDA"));
}

#[tokio::test]
async fn test_every_table_is_recreated() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "F.K03200$Z.D40113.PAISCSV", "105;BRASIL\n");
    write(dir.path(), "LEIAME.txt", "not data\n");

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 10).run(dir.path()).await.unwrap();

    assert_eq!(*sink.recreated.lock().unwrap(), all_tables());
    assert_eq!(summary.types.len(), 10);
    assert_eq!(summary.unclassified, vec!["LEIAME.txt".to_string()]);
    let empresa = summary.report(RecordType::Empresa).unwrap();
    assert!(!empresa.was_loaded());
    assert_eq!(empresa.state, TypeState::Done);
    assert_eq!(summary.indexes_created, key_tables());
}

#[tokio::test]
async fn test_type_without_files_is_emptied_on_rerun() {
    let first = TempDir::new().unwrap();
    write(first.path(), "K.EMPRECSV", COMPANY_FILE);
    write(first.path(), "F.PAISCSV", "105;BRASIL\n");
    let second = TempDir::new().unwrap();
    write(second.path(), "F.PAISCSV", "105;BRASIL\n");

    let sink = Arc::new(MemorySink::default());
    orchestrator(sink.clone(), 10).run(first.path()).await.unwrap();
    assert_eq!(sink.rows("empresa").len(), 3);

    let summary = orchestrator(sink.clone(), 10).run(second.path()).await.unwrap();

    assert!(sink.rows("empresa").is_empty());
    assert_eq!(sink.rows("pais").len(), 1);
    assert_eq!(summary.report(RecordType::Empresa).unwrap().rows_loaded, 0);
}

#[tokio::test]
async fn test_reports_follow_registry_order() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "A.QUALSCSV", "05;Administrador\n");
    write(dir.path(), "B.CNAECSV", reference_lines(3).as_str());
    write(dir.path(), "C.EMPRECSV", COMPANY_FILE);

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 10).run(dir.path()).await.unwrap();

    let order: Vec<RecordType> = summary.types.iter().map(|t| t.record_type).collect();
    assert_eq!(order, RecordType::ALL.to_vec());
    assert_eq!(*sink.recreated.lock().unwrap(), all_tables());
    assert_eq!(summary.report(RecordType::Cnae).unwrap().rows_loaded, 3);
    assert_eq!(summary.indexes_created, key_tables());
}

#[tokio::test]
async fn test_batch_failure_does_not_stop_later_batches() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "F.CNAECSV", reference_lines(10).as_str());

    // Second of four batches fails
    let sink = Arc::new(MemorySink::failing_appends(&[2]));
    let summary = orchestrator(sink.clone(), 3).run(dir.path()).await.unwrap();

    let report = summary.report(RecordType::Cnae).unwrap();
    assert_eq!(report.batches_loaded, 3);
    assert_eq!(report.batches_failed, 1);
    assert_eq!(report.rows_loaded, 7);
    assert_eq!(report.files_processed, 1);

    let codes: Vec<String> = sink
        .rows("cnae")
        .iter()
        .map(|r| r.get(0).unwrap().to_string())
        .collect();
    assert_eq!(codes, vec!["0000", "0001", "0002", "0006", "0007", "0008", "0009"]);
}

#[tokio::test]
async fn test_batches_are_ceiling_of_lines_over_chunk() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "F.MOTICSV", reference_lines(25).as_str());

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 10).run(dir.path()).await.unwrap();

    let report = summary.report(RecordType::Moti).unwrap();
    assert_eq!(report.batches_loaded, 3);
    assert_eq!(report.rows_loaded, 25);
}

#[tokio::test]
async fn test_files_of_a_type_load_in_listing_order() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "Y1.SOCIOCSV", "22222222;2;B;;;;;;;;\n");
    write(dir.path(), "Y0.SOCIOCSV", "11111111;2;A;;;;;;;;\n");

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 10).run(dir.path()).await.unwrap();

    assert_eq!(summary.report(RecordType::Socios).unwrap().files_processed, 2);
    let keys: Vec<String> = sink
        .rows("socios")
        .iter()
        .map(|r| r.get(0).unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["11111111", "22222222"]);
}

#[tokio::test]
async fn test_missing_file_is_isolated() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "B.NATJUCSV", "2062;Sociedade Empresaria Limitada\n");

    let classification = Classification::from_names(["A.NATJUCSV", "B.NATJUCSV"]);
    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink.clone(), 10)
        .ingest(dir.path(), &classification)
        .await
        .unwrap();

    let report = summary.report(RecordType::Natju).unwrap();
    assert_eq!(report.failed_files, vec!["A.NATJUCSV".to_string()]);
    assert_eq!(report.files_processed, 1);
    assert_eq!(report.rows_loaded, 1);
    assert_eq!(summary.failed_files(), vec!["A.NATJUCSV"]);
}

#[tokio::test]
async fn test_two_runs_load_the_same_rows() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "K.EMPRECSV", COMPANY_FILE);
    write(dir.path(), "F.MUNICCSV", reference_lines(4).as_str());

    let sink = Arc::new(MemorySink::default());
    let first = orchestrator(sink.clone(), 2).run(dir.path()).await.unwrap();
    let after_first = (sink.rows("empresa"), sink.rows("munic"));
    let second = orchestrator(sink.clone(), 2).run(dir.path()).await.unwrap();

    assert_eq!(first.rows_loaded(), 7);
    assert_eq!(second.rows_loaded(), first.rows_loaded());
    assert_eq!((sink.rows("empresa"), sink.rows("munic")), after_first);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_parallel_types_keep_registry_order() {
    let dir = TempDir::new().unwrap();
    for (name, body) in [
        ("A.PAISCSV", reference_lines(5)),
        ("B.CNAECSV", reference_lines(7)),
        ("C.MOTICSV", reference_lines(2)),
    ] {
        write(dir.path(), name, &body);
    }

    let sink = Arc::new(MemorySink::default());
    let settings = LoadSettings {
        chunk_size: 2,
        type_concurrency: 4,
        ..Default::default()
    };
    let summary = Orchestrator::new(RunContext::new(sink.clone(), settings))
        .run(dir.path())
        .await
        .unwrap();

    let order: Vec<RecordType> = summary.types.iter().map(|t| t.record_type).collect();
    assert_eq!(order, RecordType::ALL.to_vec());
    assert_eq!(summary.rows_loaded(), 14);
    assert_eq!(sink.rows("cnae").len(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_types_run_in_parallel() {
    let dir = TempDir::new().unwrap();
    // Adjacent in registry order, so both are in flight together
    write(dir.path(), "A.CNAECSV", reference_lines(3).as_str());
    write(dir.path(), "B.MOTICSV", reference_lines(3).as_str());

    let sink = Arc::new(RendezvousSink::new(&["cnae", "moti"]));
    let settings = LoadSettings {
        type_concurrency: 2,
        ..Default::default()
    };
    let summary = Orchestrator::new(RunContext::new(sink.clone(), settings))
        .run(dir.path())
        .await
        .unwrap();

    let mut met = sink.met.lock().unwrap().clone();
    met.sort_unstable();
    assert_eq!(met, vec!["cnae", "moti"]);
    assert_eq!(summary.rows_loaded(), 6);
    assert_eq!(sink.inner.rows("moti").len(), 3);
}

#[tokio::test]
async fn test_table_preparation_failure_is_fatal() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "F.PAISCSV", "105;BRASIL\n");

    let sink = Arc::new(MemorySink {
        fail_recreate: true,
        ..Default::default()
    });
    let err = orchestrator(sink, 10).run(dir.path()).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_missing_source_directory_is_fatal() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::default());
    let err = orchestrator(sink, 10)
        .run(&dir.path().join("absent"))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_summary_serializes_to_json() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "F.PAISCSV", "105;BRASIL\n");

    let sink = Arc::new(MemorySink::default());
    let summary = orchestrator(sink, 10).run(dir.path()).await.unwrap();

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["types"][8]["record_type"], "pais");
    assert_eq!(json["types"][8]["rows_loaded"], 1);
    assert_eq!(json["types"][8]["state"]["state"], "done");
}
