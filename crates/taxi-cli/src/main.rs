use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use taxi_core::{RunPeriod, StageKind};
use taxi_pipeline::{build_pipeline, build_scheduler, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taxi-cli")]
#[command(about = "NYC taxi trip pipeline")]
struct Cli {
    /// YAML config file. Without it, settings come from the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all five stages once for the current period.
    Run,
    /// Run daily on the configured cron schedule until interrupted.
    Schedule,
    /// Run a single stage once, without retries.
    Stage {
        #[arg(value_enum)]
        stage: StageArg,
    },
    /// Print the period the next run would target.
    Period,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Fetch,
    StageLoad,
    Normalize,
    Publish,
    WarehouseLoad,
}

impl From<StageArg> for StageKind {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Fetch => StageKind::Fetch,
            StageArg::StageLoad => StageKind::StageLoad,
            StageArg::Normalize => StageKind::Normalize,
            StageArg::Publish => StageKind::Publish,
            StageArg::WarehouseLoad => StageKind::WarehouseLoad,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_yaml_path(path),
        None => {
            let config = PipelineConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let run = build_pipeline(&config)?.run(RunPeriod::current()).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if !run.succeeded() {
                bail!(
                    "run {} failed at {}",
                    run.run_id,
                    run.failed_stage().map(|s| s.as_str()).unwrap_or("unknown stage")
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline(&config)?);
            let mut sched = build_scheduler(pipeline, &config.schedule_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.schedule_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Stage { stage } => {
            let kind = StageKind::from(stage);
            let report = build_pipeline(&config)?
                .run_single(kind, RunPeriod::current())
                .await
                .with_context(|| format!("{kind} stage failed"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Period => {
            println!("{}", RunPeriod::current());
        }
    }

    Ok(())
}
