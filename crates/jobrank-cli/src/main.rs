use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobrank_adapters::{FileBatchFetcher, RecordNormalizer, SourceFetcher};
use jobrank_core::JobStatus;
use jobrank_storage::PgJobStore;
use jobrank_sync::{
    load_criteria, maybe_build_scheduler, oracle_from_env, open_store, save_criteria,
    CriteriaEngine, PipelineConfig, Prioritizer, RankedBatch, SyncPipeline,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobrank")]
#[command(about = "Rank scraped job postings against your criteria")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rank a batch file and print the result without storing anything.
    Rank {
        #[arg(long)]
        batch: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        no_oracle: bool,
    },
    /// Fetch, rank, store and report once.
    Sync,
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the cron schedule in the foreground until interrupted.
    Schedule,
    Migrate,
    Mark {
        identifier: String,
        status: String,
    },
    #[command(subcommand)]
    Criteria(CriteriaCommand),
}

#[derive(Debug, Subcommand)]
enum CriteriaCommand {
    List,
    Set { name: String, tier: String },
    Remove { name: String },
    /// Keep a criterion but stop scoring with it.
    Disable { name: String },
    Enable { name: String },
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    token
}

fn print_ranked(ranked: &RankedBatch) {
    for (rank, result) in ranked.results.iter().enumerate() {
        println!(
            "{:>3}. [{:>2} {:<6}] {} ({}, {})",
            rank + 1,
            result.score,
            result.priority,
            result.candidate.title,
            result.candidate.job_type,
            result.candidate.identifier
        );
        println!("       {}", result.explanation);
    }
    let summary = &ranked.summary;
    println!(
        "received={} ranked={} skipped={} duplicates={} oracle_failures={}",
        summary.received,
        summary.ranked,
        summary.skipped_count(),
        summary.duplicates,
        summary.oracle_failures
    );
    for skipped in &summary.skipped {
        println!(
            "  skipped #{} {}: {}",
            skipped.position,
            skipped.identifier.as_deref().unwrap_or("-"),
            skipped.reason
        );
    }
}

async fn rank(config: PipelineConfig, batch: Option<PathBuf>, json: bool, no_oracle: bool) -> Result<()> {
    let path = config.resolve(&batch.unwrap_or_else(|| config.batch_path.clone()));
    let document = FileBatchFetcher::new(&path).fetch_batch().await?;
    let criteria = load_criteria(&config.criteria_file()).await?;
    let engine = Arc::new(CriteriaEngine::new(criteria, config.scoring));
    let mut prioritizer = Prioritizer::new(engine, config.prioritizer.clone())
        .with_normalizer(RecordNormalizer::new(config.records_key.clone()));
    if !no_oracle {
        if let Some(oracle) = oracle_from_env()? {
            prioritizer = prioritizer.with_oracle(oracle);
        }
    }
    let ranked = prioritizer
        .rank(&document, &cancel_on_ctrl_c())
        .await
        .with_context(|| format!("ranking {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ranked)?);
    } else {
        print_ranked(&ranked);
    }
    Ok(())
}

fn toggle(engine: &CriteriaEngine, name: &str, active: bool) -> Result<()> {
    let Some(criterion) = engine.set_active(name, active) else {
        anyhow::bail!("no criterion named `{name}`");
    };
    println!("{} active={}", criterion.name, criterion.active);
    Ok(())
}

async fn criteria(config: PipelineConfig, command: CriteriaCommand) -> Result<()> {
    let path = config.criteria_file();
    let engine = CriteriaEngine::new(load_criteria(&path).await?, config.scoring);
    match command {
        CriteriaCommand::List => {
            for criterion in engine.snapshot().iter() {
                let state = if criterion.active { "" } else { " (inactive)" };
                println!("{:<24} {}{state}", criterion.name, criterion.tier);
            }
            return Ok(());
        }
        CriteriaCommand::Set { name, tier } => {
            let tier = engine.set_criterion(&name, &tier)?;
            println!("{} -> {tier}", name.trim());
        }
        CriteriaCommand::Remove { name } => match engine.remove(&name) {
            Some(removed) => println!("removed {}", removed.name),
            None => anyhow::bail!("no criterion named `{name}`"),
        },
        CriteriaCommand::Disable { name } => toggle(&engine, &name, false)?,
        CriteriaCommand::Enable { name } => toggle(&engine, &name, true)?,
    }
    save_criteria(&path, &engine.snapshot()).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("jobrank=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Rank {
            batch,
            json,
            no_oracle,
        } => rank(config, batch, json, no_oracle).await?,
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline
                .run_once_with_cancel(&cancel_on_ctrl_c())
                .await?;
            println!(
                "sync complete: run_id={} ranked={} skipped={} created={} updated={} failed={} reports={}",
                summary.run_id,
                summary.batch.ranked,
                summary.batch.skipped_count(),
                summary.persisted.created,
                summary.persisted.updated,
                summary.persisted.failures.len(),
                summary.reports_dir
            );
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| {
                std::env::var("JOBRANK_WEB_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8000)
            });
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            jobrank_web::serve_with_scheduler(pipeline, port).await?;
        }
        Commands::Schedule => {
            let config = PipelineConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut scheduler) = maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler could not be built");
            };
            scheduler.start().await?;
            info!(%cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to migrate")?;
            let store = PgJobStore::connect(url).await?;
            store.ensure_schema().await?;
            println!("schema ready");
        }
        Commands::Mark { identifier, status } => {
            let status: JobStatus = status.parse()?;
            let store = open_store(&config).await?;
            let record = store.set_status(&identifier, status).await?;
            println!("{} -> {}", record.identifier(), record.status);
        }
        Commands::Criteria(command) => criteria(config, command).await?,
    }

    Ok(())
}
