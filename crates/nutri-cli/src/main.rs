use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nutri_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nutri-cli")]
#[command(about = "Catalog transform-and-persist pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean, enrich and upsert one full snapshot.
    Run {
        /// Snapshot file; overrides NUTRI_SNAPSHOT_PATH.
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Export the Feature Table and reports without touching the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the catalog tables if they do not exist.
    Migrate,
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nutri_sync=info,nutri_storage=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        snapshot: None,
        dry_run: false,
    }) {
        Commands::Run { snapshot, dry_run } => {
            if let Some(path) = snapshot {
                config.snapshot_path = path;
            }
            let summary = nutri_sync::run_sync_once(&config, dry_run).await?;
            println!(
                "run complete: run_id={} raw={} skipped={} anomalies={} nulled={} written={} reports={}",
                summary.run_id,
                summary.raw_records,
                summary.skipped_rows,
                summary.arithmetic_anomalies,
                summary.nulled_values,
                summary.rows_written,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            nutri_sync::migrate(&config).await?;
            println!("catalog tables ready on {}", config.store.target());
        }
        Commands::Report { runs } => {
            println!("{}", nutri_sync::report_markdown(runs, &config.workspace_root)?);
        }
    }

    Ok(())
}
