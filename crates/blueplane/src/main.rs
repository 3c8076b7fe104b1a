//! Blueplane pipeline binary.
//!
//! Opens the SQLite stores under the data directory, journals the DLQ next
//! to them, and runs the pipeline until interrupted.

use anyhow::Context;
use blueplane::{Pipeline, PipelineConfig, Stores};
use blueplane_storage::{SqliteConversationStore, SqliteMetricsStore, SqliteRawStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "blueplane", about = "Local-first telemetry pipeline for AI-assisted coding events")]
struct Args {
    /// Directory holding the SQLite stores and the DLQ journal.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Number of CDC worker tasks.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Tracing filter, e.g. `info` or `blueplane=debug`.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).context("invalid --log-filter expression")?,
        )
        .init();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating data dir {}", args.data_dir.display()))?;

    let stores = Stores {
        raw: Arc::new(SqliteRawStore::open(args.data_dir.join("raw.db")).await?),
        conversations: Arc::new(
            SqliteConversationStore::open(args.data_dir.join("conversations.db")).await?,
        ),
        metrics: Arc::new(SqliteMetricsStore::open(args.data_dir.join("metrics.db")).await?),
    };

    let mut config = PipelineConfig::default();
    config.hub.dlq_journal = Some(args.data_dir.join("dlq.journal"));
    config.pool.workers = args.workers;

    let pipeline = Pipeline::start(config, stores).await?;
    info!(data_dir = %args.data_dir.display(), workers = args.workers, "blueplane running");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    info!("interrupt received");
    pipeline.shutdown().await;
    Ok(())
}
