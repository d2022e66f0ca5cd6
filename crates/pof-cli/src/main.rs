use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pof_core::ProcessingMode;
use pof_pipeline::{connect_pipeline, stats_markdown, PipelineConfig, RunOptions, StageSelector};
use pof_storage::EventStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pof-cli")]
#[command(about = "Pain Opportunity Finder command-line interface")]
struct Cli {
    /// Directory holding pof.yaml, the inbox and the reports.
    #[arg(long, global = true, default_value = ".")]
    workspace_root: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one stage or the whole pipeline.
    Run(RunArgs),
    /// Create or update the database schema.
    Migrate,
    /// Print table counts, lifecycle counts and the top opportunities.
    Stats {
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// all, fetch, filter, extract, cluster, score or shortlist.
    #[arg(default_value = "all")]
    stage: StageSelector,
    /// Reprocess everything instead of only what arrived since the last successful run.
    #[arg(long, conflicts_with = "incremental")]
    process_all: bool,
    #[arg(long)]
    incremental: bool,
    /// Write reports/<run_id>/run_summary.json and Parquet snapshots.
    #[arg(long)]
    save_results: bool,
    /// Append per-stage metrics to reports/metrics.jsonl.
    #[arg(long)]
    enable_monitoring: bool,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            stage: self.stage,
            mode: if self.process_all && !self.incremental {
                ProcessingMode::ProcessAll
            } else {
                ProcessingMode::Incremental
            },
            save_results: self.save_results,
            enable_monitoring: self.enable_monitoring,
        }
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("pof=info"))?;
    let json = std::env::var("POF_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = PipelineConfig::load(&cli.workspace_root)?;

    match cli.command.unwrap_or(Commands::Run(RunArgs {
        stage: StageSelector::All,
        process_all: false,
        incremental: true,
        save_results: false,
        enable_monitoring: false,
    })) {
        Commands::Run(args) => {
            let pipeline = connect_pipeline(config).await?;
            let cancel = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let outcome = pipeline.run_until(args.options(), cancel).await?;
            let summary = serde_json::to_string_pretty(&outcome.summary)
                .context("rendering run summary")?;
            println!("{summary}");
            if let Some(path) = &outcome.summary_path {
                info!(path = %path.display(), "run summary saved");
            }
            if let Some(failure) = &outcome.failure {
                error!(
                    stage = %failure.stage,
                    last_committed = ?failure.last_committed_stage,
                    "{failure}"
                );
                return Ok(ExitCode::FAILURE);
            }
            if !outcome.succeeded() {
                warn!(status = outcome.status.as_str(), "run did not complete");
                return Ok(ExitCode::from(130));
            }
        }
        Commands::Migrate => {
            let store = EventStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            store.migrate().await.context("applying schema")?;
            println!("schema ready at {}", config.database_url);
        }
        Commands::Stats { min_score } => {
            let store = EventStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            println!("{}", stats_markdown(&store, min_score).await?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
