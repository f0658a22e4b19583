use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use petetl_adapters::SourceLocator;
use petetl_core::RunStatus;
use petetl_storage::RunHistoryLog;
use petetl_sync::{build_scheduler, derive_metrics, pipeline_from_config, EtlConfig, PgPetStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "petetl")]
#[command(about = "Pet adoption CSV ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once against a local path or http(s) URL.
    Run {
        #[arg(long)]
        source: Option<String>,
    },
    /// Apply the embedded database migrations.
    Migrate,
    /// Serve the dashboard and upload API.
    Serve,
    /// Run the pipeline on a fixed interval until interrupted.
    Schedule {
        #[arg(long)]
        source: Option<String>,
    },
    /// Print metrics derived from the run-history log.
    Metrics,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn source_or_default(config: &EtlConfig, source: Option<String>) -> SourceLocator {
    source
        .map(|raw| SourceLocator::parse(&raw))
        .unwrap_or_else(|| config.source_locator())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { source: None }) {
        Commands::Run { source } => {
            let config = EtlConfig::from_env();
            let source = source_or_default(&config, source);
            let pipeline = pipeline_from_config(config)?;
            let summary = pipeline.run_once(&source).await?;
            println!(
                "run complete: run_id={} status={} extracted={} rejected={} inserted={} updated={} failed={}",
                summary.run_id,
                summary.status,
                summary.counts.extracted,
                summary.counts.rejected,
                summary.counts.inserted,
                summary.counts.updated,
                summary.counts.failed,
            );
            if summary.status == RunStatus::Failed {
                bail!(
                    "ETL run failed: {}",
                    summary.failure_reason.unwrap_or_else(|| "unknown error".into())
                );
            }
        }
        Commands::Migrate => {
            let config = EtlConfig::from_env();
            let store = PgPetStore::connect(&config.database_url, config.db_timeout())
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            petetl_web::serve_from_env().await?;
        }
        Commands::Schedule { source } => {
            let mut config = EtlConfig::from_env();
            config.scheduler_enabled = true;
            let source = source_or_default(&config, source);
            let pipeline = Arc::new(pipeline_from_config(config)?);

            let first = pipeline.run_once(&source).await?;
            info!(status = %first.status, "initial ETL run finished");

            let Some(mut scheduler) = build_scheduler(pipeline.clone(), source).await? else {
                bail!("scheduler was not built");
            };
            scheduler.start().await.context("starting ETL scheduler")?;
            info!(
                every_secs = pipeline.config().run_interval_secs,
                "ETL scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            scheduler.shutdown().await.context("stopping ETL scheduler")?;
        }
        Commands::Metrics => {
            let config = EtlConfig::from_env();
            let history = RunHistoryLog::new(config.log_file_path.clone());
            let lines = history.tail(config.log_tail_lines).await?;
            let metrics = derive_metrics(&lines);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}
