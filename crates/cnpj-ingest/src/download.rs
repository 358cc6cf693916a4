//! Snapshot discovery and download
//!
//! The release site is a plain HTML directory listing. The base page lists one
//! `YYYY-MM/` directory per monthly release; the latest one holds the `.zip`
//! archives. Older layouts put the archives directly on the base page, which
//! is used as-is when it already lists `.zip` links.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use cnpj_common::retry::RetryPolicy;

use crate::config::HttpConfig;
use crate::error::{IngestError, Result};

/// One downloadable archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Archive {
    pub name: String,
    pub url: String,
}

/// Archives of one release
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// `YYYY-MM` of the release, when the listing used monthly directories
    pub release: Option<String>,
    pub url: String,
    pub archives: Vec<Archive>,
}

/// What happened to one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloaded,
    /// Local copy already has the server's size
    Unchanged,
}

/// HTTP client for the release listing
pub struct SnapshotSource {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl SnapshotSource {
    pub fn new(base_url: &str, http: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(http.timeout())
            .user_agent(concat!("cnpj-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: parse_directory_url(base_url)?,
            retry: http.retry_policy(),
        })
    }

    /// Find the latest release and its archives
    pub async fn discover(&self) -> Result<Snapshot> {
        info!(url = %self.base_url, "Discovering latest snapshot");
        let links = parse_links(&self.fetch_listing(&self.base_url).await?);

        let (release, listing_url, links) = match latest_release_dir(&links) {
            Some(dir) => {
                let url = join_url(&self.base_url, &dir)?;
                let release = dir.trim_end_matches('/').to_string();
                info!(release = %release, "Latest release directory");
                let links = parse_links(&self.fetch_listing(&url).await?);
                (Some(release), url, links)
            },
            None => (None, self.base_url.clone(), links),
        };

        let archives = zip_links(&links)
            .into_iter()
            .map(|href| {
                let url = join_url(&listing_url, &href)?;
                Ok(Archive {
                    name: archive_name(&url),
                    url: url.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if archives.is_empty() {
            return Err(IngestError::Listing(format!(
                "No .zip archives listed at {}",
                listing_url
            )));
        }

        info!(archives = archives.len(), "Snapshot discovered");
        Ok(Snapshot {
            release,
            url: listing_url.to_string(),
            archives,
        })
    }

    /// Download every archive of `snapshot` into `dir`
    ///
    /// Stops at the first archive that still fails after retries.
    pub async fn download_all(&self, snapshot: &Snapshot, dir: &Path) -> Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(dir).await?;

        let mut paths = Vec::with_capacity(snapshot.archives.len());
        for (index, archive) in snapshot.archives.iter().enumerate() {
            info!(
                archive = %archive.name,
                position = index + 1,
                of = snapshot.archives.len(),
                "Fetching archive"
            );
            let target = dir.join(&archive.name);
            self.retry
                .run("download archive", || self.download(archive, &target))
                .await?;
            paths.push(target);
        }
        Ok(paths)
    }

    /// Download one archive unless the local copy already matches its size
    pub async fn download(&self, archive: &Archive, target: &Path) -> Result<DownloadStatus> {
        let remote_size = self.remote_size(&archive.url).await;

        if let (Some(remote), Ok(local)) = (remote_size, tokio::fs::metadata(target).await) {
            if local.len() == remote {
                info!(archive = %archive.name, bytes = remote, "Local copy is current, skipping");
                return Ok(DownloadStatus::Unchanged);
            }
        }

        let response = self
            .client
            .get(&archive.url)
            .send()
            .await?
            .error_for_status()?;
        let progress = download_progress(response.content_length().or(remote_size), &archive.name);
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            progress.inc(chunk.len() as u64);
        }
        file.flush().await?;
        progress.finish_and_clear();

        info!(archive = %archive.name, bytes = progress.position(), "Archive downloaded");
        Ok(DownloadStatus::Downloaded)
    }

    /// `Content-Length` the server reports for `url` on a `HEAD` request
    ///
    /// Unknown when the request fails or the header is absent.
    async fn remote_size(&self, url: &str) -> Option<u64> {
        let response = match self.client.head(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "Size check failed");
                return None;
            },
        };
        response
            .headers()
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    async fn fetch_listing(&self, url: &Url) -> Result<String> {
        self.retry
            .run("fetch listing", || async {
                debug!(url = %url, "Fetching directory listing");
                let response = self.client.get(url.clone()).send().await?.error_for_status()?;
                Ok::<_, IngestError>(response.text().await?)
            })
            .await
    }
}

/// Every `href` of the page, in document order
pub fn parse_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .map(str::to_string)
        .collect()
}

/// Latest `YYYY-MM/` directory among `links`, normalised with a trailing `/`
pub fn latest_release_dir(links: &[String]) -> Option<String> {
    links
        .iter()
        .map(|href| href.trim_end_matches('/'))
        .filter(|name| is_release_name(name))
        .max()
        .map(|name| format!("{}/", name))
}

fn is_release_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().chain(&bytes[5..]).all(u8::is_ascii_digit)
}

/// Links ending in `.zip`, in listing order without duplicates
pub fn zip_links(links: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    links
        .iter()
        .filter(|href| href.to_lowercase().ends_with(".zip"))
        .filter(|href| seen.insert(href.as_str()))
        .cloned()
        .collect()
}

fn parse_directory_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    let normalised = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&normalised).map_err(|e| IngestError::Listing(format!("Invalid URL {}: {}", raw, e)))
}

fn join_url(base: &Url, href: &str) -> Result<Url> {
    base.join(href)
        .map_err(|e| IngestError::Listing(format!("Invalid link {}: {}", href, e)))
}

fn archive_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("archive.zip")
        .to_string()
}

fn download_progress(size: Option<u64>, name: &str) -> ProgressBar {
    let progress = match size {
        Some(size) => ProgressBar::new(size),
        None => ProgressBar::new_spinner(),
    };
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        progress.set_style(style.progress_chars("#>-"));
    }
    progress.set_message(name.to_string());
    progress
}
