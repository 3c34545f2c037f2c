use anyhow::Result;
use clap::{Parser, Subcommand};
use odi_sync::{PipelineRunSummary, RunOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "odi")]
#[command(about = "Open Data Ingest: page Socrata datasets into Postgres/PostGIS")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the schema bootstrap scripts.
    Init,
    /// Fetch and load datasets from the registry.
    Load {
        /// Load only this dataset (even if disabled in the registry).
        #[arg(long)]
        dataset: Option<String>,
        /// Resume from this offset instead of the registry's start_offset.
        #[arg(long, requires = "dataset")]
        start_offset: Option<u64>,
        /// Write into an in-memory sink instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the aggregate view.
    Refresh,
    /// Init, load every enabled dataset, then refresh.
    Run {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Init => {
            let statements = odi_sync::init_schema_from_env().await?;
            println!("init complete: statements={statements}");
        }
        Commands::Load {
            dataset,
            start_offset,
            dry_run,
            json,
        } => {
            let summary = odi_sync::run_pipeline_once_from_env(RunOptions {
                dataset,
                start_offset,
                skip_init: true,
                skip_refresh: true,
                dry_run,
            })
            .await?;
            print_summary(&summary, json)?;
        }
        Commands::Refresh => {
            odi_sync::refresh_aggregate_from_env().await?;
            println!("aggregate refreshed");
        }
        Commands::Run { json } => {
            let summary = odi_sync::run_pipeline_once_from_env(RunOptions::default()).await?;
            print_summary(&summary, json)?;
        }
    }

    Ok(())
}

fn print_summary(summary: &PipelineRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    for dataset in &summary.datasets {
        println!(
            "{}: pages={} records={} rows_affected={} geometry_coerced={} resume_offset={}",
            dataset.dataset,
            dataset.load.pages,
            dataset.load.records,
            dataset.load.rows_affected,
            dataset.load.geometry_coerced,
            dataset.resume_offset
        );
    }
    tracing::info!(
        run_id = %summary.run_id,
        datasets = summary.datasets.len(),
        dry_run = summary.dry_run,
        aggregate_refreshed = summary.aggregate_refreshed,
        "run complete"
    );
    Ok(())
}
