use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabsync_core::render_table;
use tabsync_sync::{prepare_snapshot, run_sync_once_from_env, IoConfig};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tabsync")]
#[command(about = "Merge two record files, snapshot them as JSON and upsert into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load, merge, snapshot and upsert (the default).
    Run,
    /// Load, merge and snapshot only; no database settings needed.
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dotenv_path = dotenvy::dotenv().ok();

    // Logs go to stderr so stdout carries only the table.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(path) = dotenv_path {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = run_sync_once_from_env()
                .await
                .context("sync run failed")?;
            tracing::info!(
                run_id = %summary.run_id,
                merged = summary.merged_rows,
                upserted = summary.upserted_rows,
                snapshot = %summary.snapshot.path.display(),
                "sync complete"
            );
            println!("{}", render_table(&summary.table));
        }
        Commands::Snapshot => {
            let io = IoConfig::from_env();
            let prepared = prepare_snapshot(&io, Uuid::new_v4())
                .await
                .context("snapshot run failed")?;
            tracing::info!(
                merged = prepared.merged_rows,
                snapshot = %prepared.snapshot.path.display(),
                sha256 = %prepared.snapshot.sha256,
                "snapshot complete"
            );
            println!("{}", render_table(&prepared.reloaded));
        }
    }

    Ok(())
}
