//! Camara Ingest - Chamber of Deputies data ingestion tool

use anyhow::{Context, Result};
use camara_common::{
    logging::{init_logging, LogConfig, LogLevel},
    types::parse_date,
    EntitySelector, IngestMode,
};
use camara_ingest::{
    api::ApiClient,
    loader::PgLoader,
    orchestrator::{ExtractionOrchestrator, OrchestratorSettings, RunRequest},
    report::RunReport,
    scheduler::{Cadence, PgRunStateStore, RunStateStore, Scheduler},
    watermark::{PgWatermarkStore, WatermarkStore},
    IngestConfig,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{process, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "camara-ingest")]
#[command(author, version, about = "Chamber of Deputies open data ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion and exit
    Run(RunArgs),

    /// Run the configured cadences until interrupted
    Schedule,

    /// Show watermarks and the last run of every entity
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// full or incremental
    #[arg(short, long, default_value = "incremental")]
    mode: IngestMode,

    /// Entity to ingest, or "all" (Portuguese names accepted)
    #[arg(short, long, default_value = "all")]
    entity: EntitySelector,

    /// First day to ingest (YYYY-MM-DD); overrides --days
    #[arg(long, value_parser = parse_date)]
    start_date: Option<NaiveDate>,

    /// Last day to ingest (YYYY-MM-DD), defaults to today
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    /// Incremental only: ingest the last N days
    #[arg(long)]
    days: Option<u32>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut log_config = match LogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: invalid logging configuration: {e:#}");
            process::exit(2);
        },
    };
    log_config.log_file_prefix = "camara-ingest".to_string();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e:#}");
            process::exit(2);
        },
    };

    match execute(cli.command).await {
        Ok(true) => {},
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(1);
        },
    }
}

/// Returns `false` when a run finished with failed entities
async fn execute(command: Command) -> Result<bool> {
    let config = IngestConfig::from_env().context("Failed to load ingestion configuration")?;

    match command {
        Command::Run(args) => {
            let mut request = RunRequest::new(args.mode, args.entity)
                .between(args.start_date, args.end_date);
            request.days = args.days;
            request.validate()?;

            let pool = connect(&config).await?;
            let scheduler = build_scheduler(&config, pool)?;
            let report = scheduler.trigger(&request).await?;
            print_report(&report, args.json)?;
            Ok(!report.has_failures())
        },
        Command::Schedule => {
            let pool = connect(&config).await?;
            let scheduler = Arc::new(
                build_scheduler(&config, pool)?.with_cadences(Cadence::from_config(&config)?),
            );

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                }
                signal.cancel();
            });

            scheduler.run_until(shutdown).await?;
            Ok(true)
        },
        Command::Status { json } => {
            let pool = connect(&config).await?;
            print_status(pool, json).await?;
            Ok(true)
        },
    }
}

async fn connect(config: &IngestConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Database connection pool established");
    Ok(pool)
}

fn build_scheduler(config: &IngestConfig, pool: PgPool) -> Result<Scheduler> {
    let client = ApiClient::new(config).context("Failed to build API client")?;
    let orchestrator = ExtractionOrchestrator::new(
        Arc::new(client),
        Arc::new(PgLoader::new(pool.clone())),
        Arc::new(PgWatermarkStore::new(pool.clone())),
        OrchestratorSettings::from(config),
    );
    Ok(Scheduler::new(
        Arc::new(orchestrator),
        Arc::new(PgRunStateStore::new(pool)),
    ))
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Run {} ({})", report.run_id, report.mode);
    for outcome in &report.outcomes {
        println!("  {outcome}");
        for row in outcome.skipped_rows.iter().take(10) {
            println!("      skipped {}: {}", row.key, row.reason);
        }
        if outcome.skipped_rows.len() > 10 {
            println!("      ... and {} more", outcome.skipped_rows.len() - 10);
        }
    }
    Ok(())
}

async fn print_status(pool: PgPool, json: bool) -> Result<()> {
    let watermarks = PgWatermarkStore::new(pool.clone()).list().await?;
    let states = PgRunStateStore::new(pool).list().await?;

    if json {
        let status = serde_json::json!({ "watermarks": watermarks, "runs": states });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Watermarks");
    if watermarks.is_empty() {
        println!("  (none)");
    }
    for watermark in &watermarks {
        println!(
            "  {:<24} {}  (updated {})",
            watermark.key.to_string(),
            watermark.cursor,
            watermark.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("Runs");
    if states.is_empty() {
        println!("  (none)");
    }
    for state in &states {
        println!(
            "  {:<16} {:<10} last: {}",
            state.entity.to_string(),
            state.state.to_string(),
            state.last_outcome.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
