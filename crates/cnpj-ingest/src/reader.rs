//! Chunked record reader
//!
//! Streams one source file into batches of at most `chunk_size` rows. Each
//! physical line is decoded from ISO-8859-1, repaired by the sanitizer and
//! buffered; a full buffer is parsed with the `csv` crate (`;`, no quoting, no
//! header) into arity-checked [`Row`]s. Memory stays bounded by one buffer.
//!
//! The reader is an [`Iterator`]. It cannot rewind; reopen the file to read
//! it again. Async callers pull batches with [`ChunkedReader::next_blocking`]
//! so file reads and parsing stay off the runtime's worker threads.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use encoding_rs::mem::decode_latin1;
use serde::Serialize;
use tracing::{debug, warn, Span};

use crate::error::{IngestError, Result};
use crate::sanitizer::{sanitize, Repair, DELIMITER};
use crate::schema::{RecordType, Row, Schema, CNPJ_KEY_WIDTH};

/// Rows per batch when not configured
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// A run of consecutive rows from one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based position of this batch within its file
    pub sequence: usize,
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Line level counters for one or more files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    /// Physical lines read, blank ones included
    pub lines_read: u64,
    pub blank_skipped: u64,
    /// Lines whose surplus fields were folded into the name field
    pub merged: u64,
    /// Lines padded with empty trailing fields
    pub padded: u64,
    /// Lines lost because they still failed structural parsing
    pub dropped: u64,
    /// Repaired lines whose `cnpj_basico` is not an 8-digit key
    pub suspect_keys: u64,
}

impl ReaderStats {
    pub fn merge(&mut self, other: &ReaderStats) {
        self.lines_read += other.lines_read;
        self.blank_skipped += other.blank_skipped;
        self.merged += other.merged;
        self.padded += other.padded;
        self.dropped += other.dropped;
        self.suspect_keys += other.suspect_keys;
    }

    pub fn repaired(&self) -> u64 {
        self.merged + self.padded
    }
}

/// Lazy batch iterator over one file
pub struct ChunkedReader<R> {
    source: R,
    schema: &'static Schema,
    chunk_size: usize,
    /// Label used in log fields, usually the file name
    label: String,
    next_sequence: usize,
    stats: ReaderStats,
    raw: Vec<u8>,
    buffer: String,
    buffered_lines: usize,
    finished: bool,
}

impl ChunkedReader<BufReader<File>> {
    /// Open `path` for reading as `record_type`
    pub fn open(path: &Path, record_type: RecordType, chunk_size: usize) -> Result<Self> {
        let file = File::open(path).map_err(|source| IngestError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self::new(BufReader::new(file), record_type, chunk_size).with_label(label))
    }
}

impl<R: BufRead> ChunkedReader<R> {
    /// Read from any buffered source; a zero `chunk_size` is treated as 1
    pub fn new(source: R, record_type: RecordType, chunk_size: usize) -> Self {
        Self {
            source,
            schema: record_type.schema(),
            chunk_size: chunk_size.max(1),
            label: record_type.table_name().to_string(),
            next_sequence: 1,
            stats: ReaderStats::default(),
            raw: Vec::new(),
            buffer: String::new(),
            buffered_lines: 0,
            finished: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn record_type(&self) -> RecordType {
        self.schema.record_type
    }

    /// Fill the line buffer up to `chunk_size` data lines or end of input
    fn fill_buffer(&mut self) -> Result<()> {
        let expected = self.schema.column_count();

        while self.buffered_lines < self.chunk_size {
            self.raw.clear();
            let read = self.source.read_until(b'\n', &mut self.raw)?;
            if read == 0 {
                self.finished = true;
                break;
            }
            self.stats.lines_read += 1;

            // Every byte is its own code point, 0x80..=0x9F included
            let decoded = decode_latin1(&self.raw);
            if decoded.trim_end_matches(['\r', '\n']).is_empty() {
                self.stats.blank_skipped += 1;
                continue;
            }

            let sanitized = sanitize(&decoded, expected);
            match sanitized.repair {
                Repair::Unchanged => {},
                Repair::Merged { .. } => self.stats.merged += 1,
                Repair::Padded { .. } => self.stats.padded += 1,
            }
            if sanitized.repair.is_repaired() && self.has_suspect_key(&sanitized.line) {
                self.stats.suspect_keys += 1;
                debug!(
                    record_type = %self.schema.record_type,
                    file = %self.label,
                    line = self.stats.lines_read,
                    "Repaired line has a malformed key"
                );
            }

            self.buffer.push_str(&sanitized.line);
            self.buffer.push('\n');
            self.buffered_lines += 1;
        }

        Ok(())
    }

    fn has_suspect_key(&self, line: &str) -> bool {
        if self.schema.key_column().is_none() {
            return false;
        }
        let key = line.split(DELIMITER).next().unwrap_or_default();
        !(key.len() == CNPJ_KEY_WIDTH && key.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Parse the buffered lines into a batch and reset the buffer
    fn parse_buffer(&mut self) -> Batch {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .quoting(false)
            .has_headers(false)
            .flexible(true)
            .from_reader(self.buffer.as_bytes());

        let mut rows = Vec::with_capacity(self.buffered_lines);
        let mut dropped = 0u64;
        for record in csv_reader.records() {
            let parsed = record
                .map_err(IngestError::from)
                .and_then(|record| Row::from_fields(self.schema, record.iter()));
            match parsed {
                Ok(row) => rows.push(row),
                Err(e) => {
                    dropped += 1;
                    warn!(
                        record_type = %self.schema.record_type,
                        file = %self.label,
                        batch = self.next_sequence,
                        error = %e,
                        "Dropping unparseable line"
                    );
                },
            }
        }
        drop(csv_reader);

        self.stats.dropped += dropped;
        self.buffer.clear();
        self.buffered_lines = 0;

        let batch = Batch {
            sequence: self.next_sequence,
            rows,
        };
        self.next_sequence += 1;
        batch
    }
}

impl<R: BufRead + Send + 'static> ChunkedReader<R> {
    /// Pull the next batch on tokio's blocking thread pool
    ///
    /// The reader moves into the blocking task and is handed back with the
    /// batch. Fails only when the blocking task itself does not complete.
    pub async fn next_blocking(mut self) -> Result<(Self, Option<Result<Batch>>)> {
        let span = Span::current();
        let pulled = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let batch = self.next();
            (self, batch)
        })
        .await?;
        Ok(pulled)
    }
}

impl<R: BufRead> Iterator for ChunkedReader<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished && self.buffered_lines == 0 {
            return None;
        }

        if let Err(e) = self.fill_buffer() {
            self.finished = true;
            self.buffer.clear();
            self.buffered_lines = 0;
            return Some(Err(e));
        }

        if self.buffered_lines == 0 {
            return None;
        }

        Some(Ok(self.parse_buffer()))
    }
}
