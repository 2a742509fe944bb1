use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bento_etl::{
    batch::{parse_lookback, BatchControl, BatchRunner, LockManager, ProgressTracker, RangeRequest},
    client::Client,
    config::Config,
    metrics::BatchMetrics,
    models::StageType,
    new_db_pool,
    repository::{BatchStore, PgBatchStore},
    run_pending_migrations,
    stages::{ExtractStage, TransformStage},
    traits::Stage,
    BatchError, DbPool,
};

#[derive(Parser)]
#[command(name = "bento_etl")]
#[command(about = "Batch ETL from chain nodes into a block warehouse", long_about = None)]
struct Cli {
    /// Path to a TOML config file; environment variables override it
    #[arg(short, long, global = true)]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a stage on the configured interval, or once for a bounded range
    Run(RunArgs),
    /// Print the last in-progress or finished batch of a stage
    ShowLast(StageArgs),
    /// Ask a running batch to stop after its current chunk group
    Pause { id: i64 },
    /// Continue the latest paused or crashed batch of a stage
    Resume(StageArgs),
    /// Cancel a batch that has not finished
    Cancel { id: i64 },
    /// Replay final batch snapshots that could not be written to the database
    Reconcile,
}

#[derive(Args)]
struct StageArgs {
    #[arg(short, long, value_parser = parse_stage)]
    stage: StageType,
}

#[derive(Args)]
struct RunArgs {
    #[arg(short, long, value_parser = parse_stage)]
    stage: StageType,

    /// First position of an explicit range
    #[arg(long, requires = "end", conflicts_with = "lookback")]
    start: Option<i64>,

    /// Last position of an explicit range
    #[arg(long, requires = "start")]
    end: Option<i64>,

    /// Process what was produced within this window, e.g. 2h, 7d, 1w, 3m, 1y
    #[arg(long, value_parser = parse_lookback)]
    lookback: Option<std::time::Duration>,
}

impl RunArgs {
    fn request(&self) -> RangeRequest {
        match (self.start, self.end, self.lookback) {
            (Some(start), Some(end), _) => RangeRequest::Explicit { start, end },
            (_, _, Some(window)) => RangeRequest::Lookback(window),
            _ => RangeRequest::Incremental,
        }
    }
}

fn parse_stage(value: &str) -> Result<StageType> {
    value.parse()
}

struct App {
    config: Config,
    db: Arc<DbPool>,
    store: Arc<dyn BatchStore>,
}

impl App {
    async fn new(config: Config) -> Result<Self> {
        run_pending_migrations(&config.database.url)?;
        let db = new_db_pool(&config.database.url, Some(config.database.pool_size)).await?;
        let store: Arc<dyn BatchStore> = Arc::new(PgBatchStore::new(db.clone()));
        Ok(Self { config, db, store })
    }

    fn progress(&self) -> ProgressTracker {
        ProgressTracker::new(self.store.clone(), self.config.batch.snapshot_dir.clone())
    }

    fn runner<S: Stage>(&self, stage: S, metrics: BatchMetrics) -> BatchRunner<S> {
        BatchRunner::new(
            Arc::new(stage),
            self.store.clone(),
            LockManager::new(self.store.clone(), self.config.lock_lease()),
            self.progress(),
            self.config.runner_options(),
            metrics,
        )
    }

    fn extract_stage(&self) -> Result<ExtractStage> {
        let network = self.config.network()?;
        let chain_name = network.chain().to_string();
        let client = Client::with_timeout(network, self.config.request_timeout())?;
        Ok(ExtractStage::new(Arc::new(client), chain_name, self.db.clone()))
    }

    fn transform_stage(&self) -> Result<TransformStage> {
        let network = self.config.network()?;
        Ok(TransformStage::new(network.chain(), self.db.clone()))
    }
}

async fn drive<S: Stage>(runner: BatchRunner<S>, request: Option<RangeRequest>) -> Result<()> {
    let result = match request {
        Some(request) => runner.run_loop(request).await,
        None => runner.resume().await.map(|outcome| {
            println!("{:?}", outcome);
        }),
    };
    match runner.metrics().encode_metrics() {
        Ok(encoded) => tracing::debug!("Batch metrics:\n{}", encoded),
        Err(err) => tracing::warn!(error = ?err, "Failed to encode metrics"),
    }
    result.map_err(anyhow::Error::from)
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config_path.as_deref())?;
    let ctx = App::new(config).await.context("Failed to initialize")?;
    let metrics = BatchMetrics::new();

    match cli.command {
        Commands::Run(args) => {
            let request = args.request();
            tracing::info!(stage = %args.stage, ?request, "Starting stage");
            match args.stage {
                StageType::Extract => drive(ctx.runner(ctx.extract_stage()?, metrics), Some(request)).await?,
                StageType::Transform => {
                    drive(ctx.runner(ctx.transform_stage()?, metrics), Some(request)).await?
                }
            }
        }
        Commands::Resume(args) => match args.stage {
            StageType::Extract => drive(ctx.runner(ctx.extract_stage()?, metrics), None).await?,
            StageType::Transform => drive(ctx.runner(ctx.transform_stage()?, metrics), None).await?,
        },
        Commands::ShowLast(args) => {
            let record = BatchControl::new(ctx.store.clone()).last_run(args.stage).await?;
            println!("{}", record);
        }
        Commands::Pause { id } => {
            let record = BatchControl::new(ctx.store.clone()).pause(id).await?;
            println!("Batch {} is now {}", record.id, record.status);
        }
        Commands::Cancel { id } => {
            let record = BatchControl::new(ctx.store.clone()).cancel(id).await?;
            println!("Batch {} is now {}", record.id, record.status);
        }
        Commands::Reconcile => {
            let replayed = ctx.progress().replay_spilled().await?;
            println!("Replayed {} snapshot(s) from {}", replayed, ctx.config.batch.snapshot_dir.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let terminal = err
                .downcast_ref::<BatchError>()
                .map(BatchError::terminates_process)
                .unwrap_or(false);
            eprintln!("Error: {:#}", err);
            if terminal {
                // Chain or database unreachable.
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_select_request() {
        let cli = Cli::try_parse_from(["bento_etl", "run", "--stage", "extract", "--start", "5", "--end", "9"])
            .unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.request(), RangeRequest::Explicit { start: 5, end: 9 });

        let cli = Cli::try_parse_from(["bento_etl", "run", "--stage", "transform", "--lookback", "2h"]).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.stage, StageType::Transform);
        assert_eq!(args.request(), RangeRequest::Lookback(std::time::Duration::from_millis(7_200_000)));
    }

    #[test]
    fn test_invalid_cli_input_is_rejected() {
        assert!(Cli::try_parse_from(["bento_etl", "run", "--stage", "load"]).is_err());
        assert!(Cli::try_parse_from(["bento_etl", "run", "--stage", "extract", "--lookback", "2s"]).is_err());
        assert!(Cli::try_parse_from(["bento_etl", "run", "--stage", "extract", "--start", "1"]).is_err());
    }
}
