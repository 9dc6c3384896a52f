use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cropprice_sync::{PipelineConfig, RunOptions};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cropprice")]
#[command(about = "Agmarknet crop price sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sweep every commodity/district pair once and email the summary.
    Run {
        /// Log rows and the email instead of writing/sending them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse a downloaded export and print what would be stored.
    Extract { file: PathBuf },
    /// Run on `CROPPRICE_SCHEDULE_CRON` until interrupted.
    Schedule {
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let summary = cropprice_sync::run_job_from_env(RunOptions { dry_run }).await?;
            println!(
                "run complete: run_id={} pairs={} saved={} email_sent={}",
                summary.run_id, summary.pairs, summary.saved, summary.email_sent
            );
        }
        Commands::Extract { file } => {
            let extract = cropprice_sync::extract_file(&file)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&extract).context("serializing extract")?
            );
        }
        Commands::Schedule { dry_run } => {
            let config = PipelineConfig::from_env();
            tracing::info!(cron = %config.schedule_cron, "starting scheduler");
            let mut sched = cropprice_sync::build_scheduler(config, RunOptions { dry_run }).await?;
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
