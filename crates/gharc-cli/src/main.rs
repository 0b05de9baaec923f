use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gharc_sync::{
    build_scheduler, fetch_archives, load_archive_manifest, plan_window, report_recent_markdown,
    ArchiveWindow, Pipeline, PipelineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "gharc-cli")]
#[command(about = "GitHub Archive medallion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download hourly archive files for a date window into the raw dir.
    Fetch {
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Inclusive; defaults to the start date.
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Specific hours (0-23); all 24 when omitted.
        #[arg(long)]
        hours: Vec<u32>,
        /// YAML manifest of archive windows; replaces the date flags.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Ingest raw archives into the bronze and silver stores.
    Ingest,
    /// Replay the bronze store through the extractors into silver.
    Rebuild,
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Fetch {
            start_date,
            end_date,
            hours,
            manifest,
        } => {
            let mut plan = Vec::new();
            if let Some(path) = manifest {
                let manifest = load_archive_manifest(&path)?;
                if let Some(base_url) = manifest.base_url {
                    config.base_url = base_url;
                }
                for window in &manifest.windows {
                    plan.extend(plan_window(window));
                }
            } else {
                let start = start_date.context("--start-date is required without --manifest")?;
                let window = ArchiveWindow {
                    start_date: start,
                    end_date: end_date.unwrap_or(start),
                    hours: if hours.is_empty() { None } else { Some(hours) },
                };
                plan = plan_window(&window);
            }

            let summary = fetch_archives(&config, plan).await?;
            println!(
                "fetch complete: run_id={} planned={} downloaded={} present={} missing={} failed={}",
                summary.run_id,
                summary.planned,
                summary.downloaded,
                summary.already_present,
                summary.missing,
                summary.failed.len()
            );
            for failed in &summary.failed {
                eprintln!("  failed {}: {}", failed.file_id, failed.error);
            }
        }
        Commands::Ingest => {
            let pipeline = Arc::new(Pipeline::new(config).await?);
            if let Some(scheduler) = build_scheduler(Arc::clone(&pipeline)).await? {
                scheduler.start().await.context("starting scheduler")?;
                println!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            } else {
                let summary = pipeline.run_once().await?;
                println!(
                    "ingest complete: run_id={} files={}/{} records={} duplicates={} malformed={} failed={}",
                    summary.run_id,
                    summary.files_completed,
                    summary.files_discovered,
                    summary.records_ingested,
                    summary.duplicates_skipped,
                    summary.malformed_lines,
                    summary.files_failed
                );
                for failed in &summary.failed_files {
                    eprintln!("  failed {}: {}", failed.file_id, failed.error);
                }
            }
        }
        Commands::Rebuild => {
            let pipeline = Pipeline::new(config).await?;
            let summary = pipeline.rebuild_silver().await?;
            println!(
                "rebuild complete: replayed={} undecodable={} upserts={}",
                summary.records_replayed,
                summary.undecodable_records,
                summary.merges.events
            );
        }
        Commands::Report { runs } => {
            let markdown = report_recent_markdown(runs, &config.reports_dir)?;
            println!("{markdown}");
        }
    }

    Ok(())
}
