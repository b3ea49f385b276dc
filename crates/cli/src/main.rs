//! Harvester CLI - run a resumable crawl robot and inspect its checkpoints.

mod robot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use harvester_core::{is_aborted, FeatureRegistry};
use harvester_execution::{DataItem, RunConfig, RunController};
use harvester_storage::{CheckpointStorage, JsonCheckpointFile};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::robot::{crawl, CrawlPlan};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Checkpointed, resumable crawl runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synthetic crawl robot
    Crawl {
        /// Number of categories
        #[arg(long, default_value = "3")]
        categories: usize,
        /// Pages per category
        #[arg(long, default_value = "5")]
        pages: i64,
        /// Categories crawled concurrently
        #[arg(long, default_value = "2")]
        limit: usize,
        /// Simulated latency of every page fetch
        #[arg(long, default_value = "200")]
        delay_ms: u64,
        /// Restore from and save checkpoints to this file
        #[arg(long)]
        checkpoint_file: Option<PathBuf>,
        /// Fail when fetching this page, e.g. `category-2/3`
        #[arg(long)]
        fail_at: Option<String>,
        /// Log the progress tree at this interval
        #[arg(long)]
        progress_interval_ms: Option<u64>,
        /// Grace period for in-flight work after Ctrl-C
        #[arg(long, default_value = "5000")]
        cancel_timeout_ms: u64,
        /// Print scope timings when the run ends
        #[arg(long)]
        metrics: bool,
    },
    /// Print the ids stored in a checkpoint file
    Checkpoints {
        /// Checkpoint file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl {
            categories,
            pages,
            limit,
            delay_ms,
            checkpoint_file,
            fail_at,
            progress_interval_ms,
            cancel_timeout_ms,
            metrics,
        } => {
            let mut config = RunConfig::new("crawl").with_default_limit(limit);
            if let Some(path) = checkpoint_file {
                config = config.with_checkpoint_file(path);
            }
            if let Some(ms) = progress_interval_ms {
                config = config.with_progress_log_interval(Duration::from_millis(ms));
            }

            let plan = Arc::new(CrawlPlan {
                categories,
                pages,
                delay: Duration::from_millis(delay_ms),
                fail_at,
            });
            let run = RunController::new(config, FeatureRegistry::new(), move || crawl(plan))
                .on_data_received(|item: &DataItem| println!("{}", item.data));

            run_until_interrupted(&run, Duration::from_millis(cancel_timeout_ms)).await?;

            if metrics {
                println!("{}", serde_json::to_string_pretty(&run.metrics())?);
            }
        }
        Commands::Checkpoints { path } => {
            let Some(checkpoints) = JsonCheckpointFile::new(&path).load().await? else {
                println!("No checkpoint file at {}", path.display());
                return Ok(());
            };

            println!("Checkpoints ({})", checkpoints.len());
            for id in checkpoints {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

/// Drive `run`; on Ctrl-C cancel it and wait up to `grace` for it to stop.
async fn run_until_interrupted(run: &RunController<()>, grace: Duration) -> Result<()> {
    let start = run.start();
    tokio::pin!(start);

    let result = tokio::select! {
        result = &mut start => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, cancelling run");
            let (result, settled) = tokio::join!(
                tokio::time::timeout(grace, &mut start),
                run.cancel(Some(grace)),
            );
            if !settled? {
                warn!("Run did not stop within {}ms", grace.as_millis());
            }
            match result {
                Ok(result) => result,
                Err(_) => {
                    persist_checkpoints(run).await?;
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) if is_aborted(&err) => {
            info!("Run stopped; run again to resume");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Save what finished so far when the run is abandoned before it settles.
async fn persist_checkpoints(run: &RunController<()>) -> Result<()> {
    if let Some(path) = &run.config().checkpoint_file {
        let checkpoints = run.checkpoints();
        JsonCheckpointFile::new(path).save(&checkpoints).await?;
        info!("Saved {} checkpoints to {}", checkpoints.len(), path.display());
    }
    Ok(())
}
