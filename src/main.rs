//! CLI entry point for the GTFS ingest job.
//!
//! Downloads one feed variant, loads every table into the document store
//! under that variant's label and rebuilds the aggregated stations.

use anyhow::Result;
use clap::Parser;
use gtfs_ingest::{
    config::{Config, DataType},
    fetch::BasicClient,
    pipeline::Pipeline,
    store::SqliteStore,
    summary::print_json,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_ingest")]
#[command(about = "Load a GTFS feed into the document store and build stations", long_about = None)]
struct Cli {
    /// Ingest the regular feed (the default)
    #[arg(long, conflicts_with = "supplemented")]
    regular: bool,

    /// Ingest the supplemented feed
    #[arg(long)]
    supplemented: bool,
}

impl Cli {
    fn data_type(&self) -> DataType {
        if self.supplemented {
            DataType::Supplemented
        } else {
            DataType::Regular
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env(cli.data_type())?;
    info!(data_type = %config.data_type, "Processing GTFS data");

    let store = SqliteStore::connect(&config.database_url).await?;
    let pipeline = Pipeline::new(Arc::new(store), config);
    pipeline.ensure_indexes().await?;

    let client = BasicClient::new()?;
    let summary = pipeline.ingest(&client).await?;
    print_json(&summary)?;

    Ok(())
}
