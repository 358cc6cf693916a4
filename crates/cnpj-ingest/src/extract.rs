//! Archive extraction
//!
//! Unzips every `.zip` of the download directory into the extraction
//! directory. A corrupt archive is skipped with a warning so one bad download
//! does not block the other record types.

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::error::{IngestError, Result};

/// Archives handled by one extraction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub extracted: Vec<PathBuf>,
    /// Archives that could not be opened or unpacked, with the reason
    pub skipped: Vec<(PathBuf, String)>,
    /// Files written across all archives
    pub files: usize,
}

/// `.zip` files directly inside `dir`, sorted by name
pub fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|source| IngestError::SourceDirectory {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut archives: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
        })
        .collect();
    archives.sort();
    Ok(archives)
}

/// Extract every archive of `zip_dir` into `out_dir`
pub fn extract_all(zip_dir: &Path, out_dir: &Path) -> Result<ExtractReport> {
    std::fs::create_dir_all(out_dir)?;

    let mut report = ExtractReport::default();
    for archive in list_archives(zip_dir)? {
        match extract_archive(&archive, out_dir) {
            Ok(files) => {
                info!(archive = %archive.display(), files, "Archive extracted");
                report.files += files;
                report.extracted.push(archive);
            },
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "Skipping bad archive");
                report.skipped.push((archive, e.to_string()));
            },
        }
    }
    Ok(report)
}

/// Extract one archive, returning the number of files it held
pub fn extract_archive(archive: &Path, out_dir: &Path) -> Result<usize> {
    let file = File::open(archive).map_err(|source| IngestError::FileAccess {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(file)?;
    let files = (0..zip.len())
        .filter(|&i| zip.by_index(i).map(|entry| !entry.is_dir()).unwrap_or(false))
        .count();
    zip.extract(out_dir)?;
    Ok(files)
}
