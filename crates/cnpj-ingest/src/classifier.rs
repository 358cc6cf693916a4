//! File classifier
//!
//! Maps extracted file names to record types using the fixed markers of the
//! upstream naming convention (e.g. `K3241.K03200Y0.D40113.EMPRECSV`).
//! Matching is a case-insensitive substring test; the first rule that matches
//! wins. Files matching nothing land in the unclassified bucket so the caller
//! can report them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};
use crate::schema::RecordType;

/// Classification rules in evaluation order
pub const RULES: [(RecordType, &str); 10] = [
    (RecordType::Empresa, "EMPRECSV"),
    (RecordType::Estabelecimento, "ESTABELE"),
    (RecordType::Socios, "SOCIOCSV"),
    (RecordType::Simples, "SIMPLES.CSV"),
    (RecordType::Cnae, "CNAECSV"),
    (RecordType::Moti, "MOTICSV"),
    (RecordType::Munic, "MUNICCSV"),
    (RecordType::Natju, "NATJUCSV"),
    (RecordType::Pais, "PAISCSV"),
    (RecordType::Quals, "QUALSCSV"),
];

/// Record type of a single file name, if any rule matches
pub fn classify_name(name: &str) -> Option<RecordType> {
    let upper = name.to_uppercase();
    RULES
        .iter()
        .find(|(_, marker)| upper.contains(marker))
        .map(|(record_type, _)| *record_type)
}

/// Result of classifying a directory listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Matched files per record type, in listing order
    pub by_type: BTreeMap<RecordType, Vec<String>>,
    /// Files matching no rule, in listing order
    pub unclassified: Vec<String>,
}

impl Classification {
    /// Classify a listing of file names
    ///
    /// Names may be `/`-separated relative paths; only the final component is
    /// matched, so directory names never claim the files below them.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classification = Self::default();
        for name in names {
            let name = name.into();
            match classify_name(file_name(&name)) {
                Some(record_type) => classification
                    .by_type
                    .entry(record_type)
                    .or_default()
                    .push(name),
                None => classification.unclassified.push(name),
            }
        }
        classification
    }

    /// Files matched to `record_type` (empty when none matched)
    pub fn files_for(&self, record_type: RecordType) -> &[String] {
        self.by_type
            .get(&record_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Record types that matched no file, in registry order
    pub fn missing_types(&self) -> Vec<RecordType> {
        RecordType::ALL
            .into_iter()
            .filter(|t| self.files_for(*t).is_empty())
            .collect()
    }

    pub fn classified_count(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    /// Log unmatched files and record types without files as warnings
    pub fn report(&self) {
        for (record_type, files) in &self.by_type {
            debug!(%record_type, files = files.len(), "Files classified");
        }
        if !self.unclassified.is_empty() {
            warn!(
                count = self.unclassified.len(),
                "Files matched no classification rule and will be skipped"
            );
            for name in &self.unclassified {
                warn!(file = %name, "Unclassified file");
            }
        }
        for record_type in self.missing_types() {
            warn!(%record_type, "No files matched this record type");
        }
    }
}

/// List and classify every regular file below `root`
///
/// Nested directories are walked; names are paths relative to `root` using
/// `/` separators and sorted by file name so repeated scans agree. Failing to
/// read `root` itself is fatal, unreadable entries below it are skipped with
/// a warning.
pub fn scan_directory(root: &Path) -> Result<Classification> {
    std::fs::read_dir(root).map_err(|source| IngestError::SourceDirectory {
        path: root.to_path_buf(),
        source,
    })?;

    let mut names = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }
        names.push(relative_name(root, entry.path()));
    }

    debug!(root = %root.display(), files = names.len(), "Scanned extraction directory");
    Ok(Classification::from_names(names))
}

fn file_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}

fn relative_name(root: &Path, path: &Path) -> String {
    let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
