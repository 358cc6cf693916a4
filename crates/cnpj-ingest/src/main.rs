//! CNPJ Ingest - loads the CNPJ open data release into PostgreSQL

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cnpj_common::logging::{init_logging, LogConfig, LogLevel};
use cnpj_ingest::classifier::scan_directory;
use cnpj_ingest::config::IngestConfig;
use cnpj_ingest::database::{create_pool, PgLoader};
use cnpj_ingest::download::SnapshotSource;
use cnpj_ingest::extract::extract_all;
use cnpj_ingest::orchestrator::{LoadSettings, Orchestrator, RunContext, RunSummary};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cnpj-ingest")]
#[command(author, version, about = "CNPJ open data ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download, extract and load the latest release
    Run {
        #[command(flatten)]
        load: LoadArgs,

        /// Release listing URL
        #[arg(long, env = "DADOS_RF_URL")]
        url: Option<String>,

        /// Directory for downloaded archives
        #[arg(long, env = "OUTPUT_FILES_PATH")]
        download_dir: Option<PathBuf>,

        /// Reuse archives already in the download directory
        #[arg(long)]
        skip_download: bool,
    },

    /// Load an already extracted directory
    Load {
        #[command(flatten)]
        load: LoadArgs,
    },

    /// Print how the files of a directory are classified
    Classify {
        /// Directory to scan (defaults to EXTRACTED_FILES_PATH)
        dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Directory holding the extracted files
    #[arg(long, env = "EXTRACTED_FILES_PATH")]
    extract_dir: Option<PathBuf>,

    /// Target database
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Rows per batch
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Record types loaded at the same time
    #[arg(long)]
    type_concurrency: Option<usize>,

    /// Write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

impl LoadArgs {
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(dir) = &self.extract_dir {
            config.extract_dir = dir.clone();
        }
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if let Some(concurrency) = self.type_concurrency {
            config.type_concurrency = concurrency;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(LogLevel::Info)
        .log_file_prefix("cnpj-ingest")
        .build()
        .merge_env()
        .context("Invalid logging configuration")?;
    let log_config = apply_verbosity(log_config, cli.verbose);

    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Run {
            load,
            url,
            download_dir,
            skip_download,
        } => {
            load.apply(&mut config);
            if let Some(url) = url {
                config.base_url = url;
            }
            if let Some(dir) = download_dir {
                config.download_dir = dir;
            }
            config.validate()?;

            if !skip_download {
                let source = SnapshotSource::new(&config.base_url, &config.http)?;
                let snapshot = source.discover().await.context("Snapshot discovery failed")?;
                source
                    .download_all(&snapshot, &config.download_dir)
                    .await
                    .context("Download failed")?;
            }

            let (zip_dir, out_dir) = (config.download_dir.clone(), config.extract_dir.clone());
            let report = tokio::task::spawn_blocking(move || extract_all(&zip_dir, &out_dir))
                .await
                .context("Extraction task panicked")??;
            info!(
                archives = report.extracted.len(),
                skipped = report.skipped.len(),
                files = report.files,
                "Extraction finished"
            );

            let summary = load_directory(&config).await?;
            finish(&summary, load.summary_json.as_deref())?;
        },
        Command::Load { load } => {
            load.apply(&mut config);
            config.validate()?;

            let summary = load_directory(&config).await?;
            finish(&summary, load.summary_json.as_deref())?;
        },
        Command::Classify { dir } => {
            let dir = dir.unwrap_or_else(|| config.extract_dir.clone());
            let classification = scan_directory(&dir)?;
            classification.report();
            println!("{}", serde_json::to_string_pretty(&classification)?);
        },
    }

    Ok(())
}

async fn load_directory(config: &IngestConfig) -> Result<RunSummary> {
    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to the database")?;

    let settings = LoadSettings {
        chunk_size: config.chunk_size,
        type_concurrency: config.type_concurrency,
        batch_retry: config.batch_retry(),
    };
    let sink = Arc::new(PgLoader::new(pool, config.insert_batch_size));
    let orchestrator = Orchestrator::new(RunContext::new(sink, settings));

    info!(run_id = %orchestrator.run_id(), dir = %config.extract_dir.display(), "Loading");
    let summary = orchestrator.run(&config.extract_dir).await?;
    Ok(summary)
}

/// `--verbose` wins over `LOG_LEVEL`
fn apply_verbosity(mut config: LogConfig, verbose: bool) -> LogConfig {
    if verbose {
        config.level = LogLevel::Debug;
    }
    config
}

fn finish(summary: &RunSummary, summary_json: Option<&Path>) -> Result<()> {
    summary.log();
    if let Some(path) = summary_json {
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Summary written");
    }
    Ok(())
}
