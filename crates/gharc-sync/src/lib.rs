//! Pipeline orchestration: archive discovery, bounded-parallel ingest
//! workers, silver rebuild, run reports and parquet snapshots.

pub mod merge;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, NaiveDate, Utc};
use gharc_core::FileStatus;
use gharc_extract::{ArchiveDecoder, DecodedEvent, RawEvent};
use gharc_storage::{
    ArchiveFetcher, ArchiveHour, BackoffPolicy, BronzeError, BronzeStore, CheckpointStore,
    DownloadStatus, FetcherConfig, FsBronzeStore, FsCheckpointStore, FsSilverStore, ScanFilter,
    SilverStore, TokenBucketConfig,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use merge::{MergeEngine, MergeStats, ObservationBatches};

pub const CRATE_NAME: &str = "gharc-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding downloaded `*.json.gz` archive files.
    pub raw_dir: PathBuf,
    /// Root for the bronze/silver/checkpoint stores.
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub base_url: String,
    pub max_workers: usize,
    pub max_retries: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            raw_dir: std::env::var("GHARC_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/raw")),
            data_dir: std::env::var("GHARC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            reports_dir: std::env::var("GHARC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            base_url: std::env::var("GHARC_ARCHIVE_BASE_URL")
                .unwrap_or_else(|_| "https://data.gharchive.org".to_string()),
            max_workers: std::env::var("GHARC_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            max_retries: std::env::var("GHARC_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            scheduler_enabled: std::env::var("GHARC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("GHARC_INGEST_CRON")
                .unwrap_or_else(|_| "10 * * * *".to_string()),
            user_agent: std::env::var("GHARC_USER_AGENT")
                .unwrap_or_else(|_| "gharc-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("GHARC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Fetch planning
// ---------------------------------------------------------------------------

/// Optional YAML manifest declaring which archive windows to fetch.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveManifest {
    pub base_url: Option<String>,
    pub windows: Vec<ArchiveWindow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Specific hours to fetch; all 24 when omitted.
    #[serde(default)]
    pub hours: Option<Vec<u32>>,
}

pub fn load_archive_manifest(path: &Path) -> Result<ArchiveManifest> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Expand an inclusive date window into per-hour archive files.
pub fn plan_window(window: &ArchiveWindow) -> Vec<ArchiveHour> {
    let hours: Vec<u32> = match &window.hours {
        Some(hours) => hours.iter().copied().filter(|h| *h < 24).collect(),
        None => (0..24).collect(),
    };
    let mut plan = Vec::new();
    let mut date = window.start_date;
    while date <= window.end_date {
        for &hour in &hours {
            plan.push(ArchiveHour { date, hour });
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    plan
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub run_id: Uuid,
    pub planned: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub missing: usize,
    pub failed: Vec<FailedFile>,
}

/// Download a planned set of archive hours into the raw directory.
/// Failures are collected per file, never silently dropped.
pub async fn fetch_archives(
    config: &PipelineConfig,
    plan: Vec<ArchiveHour>,
) -> Result<FetchSummary> {
    let run_id = Uuid::new_v4();
    let fetcher = Arc::new(
        ArchiveFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: config.max_workers.max(1),
            backoff: config.backoff(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 8,
                refill_every: Duration::from_millis(250),
            }),
        })
        .context("building archive fetcher")?,
    );

    let planned = plan.len();
    let mut tasks = JoinSet::new();
    for hour in plan {
        let fetcher = Arc::clone(&fetcher);
        let base_url = config.base_url.clone();
        let raw_dir = config.raw_dir.clone();
        tasks.spawn(async move {
            let file_id = hour.file_id();
            let outcome = fetcher
                .download_archive(run_id, &base_url, hour, &raw_dir)
                .await;
            (file_id, outcome)
        });
    }

    let mut summary = FetchSummary {
        run_id,
        planned,
        downloaded: 0,
        already_present: 0,
        missing: 0,
        failed: Vec::new(),
    };
    while let Some(joined) = tasks.join_next().await {
        let (file_id, outcome) = joined.context("joining fetch task")?;
        match outcome {
            Ok(outcome) => match outcome.status {
                DownloadStatus::Downloaded => {
                    info!(%file_id, bytes = outcome.byte_size, "archive downloaded");
                    summary.downloaded += 1;
                }
                DownloadStatus::AlreadyPresent => summary.already_present += 1,
                DownloadStatus::Missing => {
                    warn!(%file_id, "archive hour missing upstream");
                    summary.missing += 1;
                }
            },
            Err(err) => {
                warn!(%file_id, error = %format!("{err:#}"), "archive download failed");
                summary.failed.push(FailedFile {
                    file_id,
                    error: format!("{err:#}"),
                });
            }
        }
    }
    summary.failed.sort_by(|a, b| a.file_id.cmp(&b.file_id));
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Archive discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArchiveFile {
    pub file_id: String,
    pub path: PathBuf,
}

fn collect_archives(dir: &Path, out: &mut Vec<ArchiveFile>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_archives(&path, out)?;
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(file_id) = name.strip_suffix(".json.gz") {
            out.push(ArchiveFile {
                file_id: file_id.to_string(),
                path,
            });
        }
    }
    Ok(())
}

/// Find every archive file under the raw directory, in stable order.
pub fn discover_archives(root: &Path) -> Result<Vec<ArchiveFile>> {
    let mut files = Vec::new();
    collect_archives(root, &mut files)?;
    files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
    Ok(files)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct FileTally {
    records: usize,
    duplicates: usize,
    malformed: usize,
    unextractable: usize,
    merges: MergeStats,
}

#[derive(Debug, Clone)]
struct FileOutcome {
    file_id: String,
    status: FileStatus,
    tally: FileTally,
    error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub file_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files_discovered: usize,
    pub files_completed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub records_ingested: usize,
    pub duplicates_skipped: usize,
    pub malformed_lines: usize,
    pub unextractable_records: usize,
    pub merges: MergeStats,
    pub failed_files: Vec<FailedFile>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildSummary {
    pub records_replayed: usize,
    pub undecodable_records: usize,
    pub merges: MergeStats,
}

/// The ingest pipeline: archive file -> decode -> dedup -> bronze ->
/// extract -> merge -> silver, one bounded worker per file.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    bronze: Arc<dyn BronzeStore>,
    silver: Arc<dyn SilverStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    merge: Arc<MergeEngine>,
}

impl Pipeline {
    /// Open the filesystem-backed stores under the configured data dir.
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let bronze = Arc::new(FsBronzeStore::new(config.data_dir.join("bronze")));
        let silver: Arc<dyn SilverStore> =
            Arc::new(FsSilverStore::new(config.data_dir.join("silver")));
        let checkpoints = Arc::new(
            FsCheckpointStore::open(config.data_dir.join("checkpoints"))
                .await
                .context("opening checkpoint store")?,
        );
        Ok(Self::with_stores(config, bronze, silver, checkpoints))
    }

    /// Inject alternative stores; the scheduler tests run on in-memory fakes.
    pub fn with_stores(
        config: PipelineConfig,
        bronze: Arc<dyn BronzeStore>,
        silver: Arc<dyn SilverStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let merge = Arc::new(MergeEngine::new(Arc::clone(&silver)));
        Self {
            config,
            bronze,
            silver,
            checkpoints,
            merge,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn silver(&self) -> &Arc<dyn SilverStore> {
        &self.silver
    }

    pub fn bronze(&self) -> &Arc<dyn BronzeStore> {
        &self.bronze
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Process every non-complete archive file once and write the run
    /// report plus silver snapshots.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let files = discover_archives(&self.config.raw_dir)?;
        let files_discovered = files.len();

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();
        let mut files_skipped = 0usize;

        for file in files {
            let status = self.checkpoints.status(&file.file_id).await?;
            if status.is_complete() {
                files_skipped += 1;
                continue;
            }
            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                pipeline.process_file(file, run_id).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = workers.join_next().await {
            outcomes.push(joined.context("joining archive worker")?);
        }
        outcomes.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            files_discovered,
            files_completed: 0,
            files_skipped,
            files_failed: 0,
            records_ingested: 0,
            duplicates_skipped: 0,
            malformed_lines: 0,
            unextractable_records: 0,
            merges: MergeStats::default(),
            failed_files: Vec::new(),
            reports_dir: String::new(),
            parquet_manifest: String::new(),
        };
        for outcome in &outcomes {
            summary.records_ingested += outcome.tally.records;
            summary.duplicates_skipped += outcome.tally.duplicates;
            summary.malformed_lines += outcome.tally.malformed;
            summary.unextractable_records += outcome.tally.unextractable;
            summary.merges.absorb(outcome.tally.merges);
            match outcome.status {
                FileStatus::Complete => summary.files_completed += 1,
                FileStatus::Failed => {
                    summary.files_failed += 1;
                    summary.failed_files.push(FailedFile {
                        file_id: outcome.file_id.clone(),
                        error: outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                _ => {}
            }
        }
        summary.finished_at = Utc::now();

        let reports_dir = self.write_reports(&summary).await?;
        let manifest_path = self.export_parquet_snapshots(&reports_dir).await?;
        summary.reports_dir = reports_dir.display().to_string();
        summary.parquet_manifest = manifest_path.display().to_string();

        // Rewrite the summary with the final paths filled in.
        let summary_json =
            serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        tokio::fs::write(reports_dir.join("run_summary.json"), summary_json)
            .await
            .context("writing run_summary.json")?;

        info!(
            run_id = %summary.run_id,
            files = summary.files_completed,
            records = summary.records_ingested,
            duplicates = summary.duplicates_skipped,
            failed = summary.files_failed,
            "ingest run complete"
        );
        Ok(summary)
    }

    /// One file end-to-end, with per-file retries; failures are surfaced
    /// as a `Failed` checkpoint and a listed outcome, never dropped.
    async fn process_file(&self, file: ArchiveFile, run_id: Uuid) -> FileOutcome {
        let span = info_span!("archive_file", %run_id, file_id = %file.file_id);
        async {
            if let Err(err) = self
                .checkpoints
                .set_status(&file.file_id, FileStatus::InProgress)
                .await
            {
                return FileOutcome {
                    file_id: file.file_id.clone(),
                    status: FileStatus::Failed,
                    tally: FileTally::default(),
                    error: Some(format!("{err:#}")),
                };
            }

            let backoff = self.config.backoff();
            let mut last_error = None;
            for attempt in 0..=backoff.max_retries {
                match self.process_file_once(&file).await {
                    Ok(tally) => {
                        if let Err(err) = self
                            .checkpoints
                            .set_status(&file.file_id, FileStatus::Complete)
                            .await
                        {
                            last_error = Some(format!("{err:#}"));
                            break;
                        }
                        return FileOutcome {
                            file_id: file.file_id.clone(),
                            status: FileStatus::Complete,
                            tally,
                            error: None,
                        };
                    }
                    Err(err) => {
                        warn!(attempt, error = %format!("{err:#}"), "archive file attempt failed");
                        last_error = Some(format!("{err:#}"));
                        if attempt < backoff.max_retries {
                            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        }
                    }
                }
            }

            let _ = self
                .checkpoints
                .set_status(&file.file_id, FileStatus::Failed)
                .await;
            FileOutcome {
                file_id: file.file_id.clone(),
                status: FileStatus::Failed,
                tally: FileTally::default(),
                error: last_error,
            }
        }
        .instrument(span)
        .await
    }

    /// A single attempt: stream-decode in a blocking task, dedup and
    /// append per record, batch observations locally, then merge.
    async fn process_file_once(&self, file: &ArchiveFile) -> Result<FileTally> {
        let (tx, mut rx) = mpsc::channel::<DecodedEvent>(256);
        let path = file.path.clone();
        let decode = tokio::task::spawn_blocking(move || -> Result<(usize, usize)> {
            let mut decoder = ArchiveDecoder::open(&path)
                .with_context(|| format!("opening archive {}", path.display()))?;
            while let Some(item) = decoder.next() {
                let event = item.with_context(|| format!("decoding {}", path.display()))?;
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            Ok((decoder.decoded(), decoder.skipped()))
        });

        let mut tally = FileTally::default();
        let mut batches = ObservationBatches::new();
        while let Some(decoded) = rx.recv().await {
            let fingerprint = decoded.fingerprint();
            if !self.checkpoints.claim(&fingerprint).await? {
                tally.duplicates += 1;
                continue;
            }
            let record = decoded.to_raw_record(&file.file_id, Utc::now());
            match self.bronze.append(&record).await {
                Ok(()) => {
                    self.checkpoints.commit(&fingerprint, &file.file_id).await?;
                    tally.records += 1;
                }
                Err(BronzeError::DuplicateKey(_)) => {
                    // The record landed in bronze but the journal missed the
                    // commit (crash window); re-commit and re-merge, which is
                    // safe because merging is idempotent.
                    self.checkpoints.commit(&fingerprint, &file.file_id).await?;
                    tally.duplicates += 1;
                }
                Err(BronzeError::Other(err)) => {
                    self.checkpoints.release(&fingerprint).await?;
                    return Err(err.context("appending to bronze store"));
                }
            }
            if !batches.record(&fingerprint, &decoded.event, Utc::now()) {
                tally.unextractable += 1;
            }
        }

        let (_, skipped) = decode.await.context("joining decode task")??;
        tally.malformed = skipped;
        tally.merges = self.merge.apply(batches).await?;
        Ok(tally)
    }

    /// Replay the committed bronze store through the extractors and merge
    /// engine; running this over an up-to-date silver store is a no-op.
    pub async fn rebuild_silver(&self) -> Result<RebuildSummary> {
        let records = self.bronze.scan(&ScanFilter::default()).await?;
        let mut batches = ObservationBatches::new();
        let mut replayed = 0usize;
        let mut undecodable = 0usize;
        for record in records {
            match serde_json::from_value::<RawEvent>(record.raw_payload.clone()) {
                Ok(event) => {
                    if batches.record(&record.fingerprint, &event, Utc::now()) {
                        replayed += 1;
                    } else {
                        undecodable += 1;
                    }
                }
                Err(err) => {
                    warn!(fingerprint = %record.fingerprint, error = %err, "bronze record no longer decodes");
                    undecodable += 1;
                }
            }
        }
        let merges = self.merge.apply(batches).await?;
        Ok(RebuildSummary {
            records_replayed: replayed,
            undecodable_records: undecodable,
            merges,
        })
    }

    async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        tokio::fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let mut failed_lines = summary
            .failed_files
            .iter()
            .map(|f| format!("- `{}`: {}", f.file_id, f.error))
            .collect::<Vec<_>>()
            .join("\n");
        if failed_lines.is_empty() {
            failed_lines = "- none".to_string();
        }

        let brief = format!(
            "# GHARC Run Brief\n\n\
             - Run ID: `{}`\n\
             - Started: {}\n\
             - Finished: {}\n\
             - Files: {} discovered, {} completed, {} skipped (already complete), {} failed\n\
             - Records: {} ingested, {} duplicates, {} malformed lines, {} unextractable\n\n\
             ## Silver Upserts\n\
             - actors: {}\n\
             - repositories: {}\n\
             - organizations: {}\n\
             - events: {}\n\
             - payload facts: {}\n\n\
             ## Failed Files\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.files_discovered,
            summary.files_completed,
            summary.files_skipped,
            summary.files_failed,
            summary.records_ingested,
            summary.duplicates_skipped,
            summary.malformed_lines,
            summary.unextractable_records,
            summary.merges.actors,
            summary.merges.repositories,
            summary.merges.organizations,
            summary.merges.events,
            summary.merges.payload_facts,
            failed_lines,
        );
        tokio::fs::write(reports_dir.join("run_brief.md"), brief)
            .await
            .context("writing run_brief.md")?;

        Ok(reports_dir)
    }

    async fn export_parquet_snapshots(&self, reports_dir: &Path) -> Result<PathBuf> {
        let snapshot_dir = reports_dir.join("snapshots");
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let events = self.silver.scan_events().await?;
        let actors = self.silver.scan_actors().await?;
        let repositories = self.silver.scan_repositories().await?;
        let organizations = self.silver.scan_organizations().await?;
        let facts = self.silver.scan_facts().await?;

        let events_path = snapshot_dir.join("events.parquet");
        let actors_path = snapshot_dir.join("actors.parquet");
        let repositories_path = snapshot_dir.join("repositories.parquet");
        let organizations_path = snapshot_dir.join("organizations.parquet");
        let facts_path = snapshot_dir.join("payload_facts.parquet");

        write_events_parquet(&events_path, &events)?;
        write_actors_parquet(&actors_path, &actors)?;
        write_repositories_parquet(&repositories_path, &repositories)?;
        write_organizations_parquet(&organizations_path, &organizations)?;
        write_facts_parquet(&facts_path, &facts)?;

        let manifest = SnapshotManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("events", reports_dir, &events_path)?,
                manifest_entry("actors", reports_dir, &actors_path)?,
                manifest_entry("repositories", reports_dir, &repositories_path)?,
                manifest_entry("organizations", reports_dir, &organizations_path)?,
                manifest_entry("payload_facts", reports_dir, &facts_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        tokio::fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

pub async fn run_ingest_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env()).await?;
    pipeline.run_once().await
}

pub async fn rebuild_silver_from_env() -> Result<RebuildSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env()).await?;
    pipeline.rebuild_silver().await
}

/// Build the optional cron scheduler driving recurring ingest runs.
pub async fn build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config().ingest_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    records = summary.records_ingested,
                    "scheduled ingest run complete"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled ingest run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Render the most recent run directories as a markdown digest.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# GHARC Recent Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join("run_summary.json");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let records = summary
            .get("records_ingested")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let duplicates = summary
            .get("duplicates_skipped")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let failed = summary
            .get("files_failed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- records ingested: {records}"));
        lines.push(format!("- duplicates skipped: {duplicates}"));
        lines.push(format!("- failed files: {failed}"));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Parquet snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file =
        std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn string_col(values: Vec<Option<String>>) -> StringArray {
    StringArray::from(values)
}

fn write_events_parquet(path: &Path, events: &[gharc_core::NormalizedEvent]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("event_hash", DataType::Utf8, false),
        ArrowField::new("event_id", DataType::Utf8, false),
        ArrowField::new("event_type", DataType::Utf8, false),
        ArrowField::new("created_at", DataType::Utf8, false),
        ArrowField::new("actor_id", DataType::Int64, true),
        ArrowField::new("repo_id", DataType::Int64, true),
        ArrowField::new("org_id", DataType::Int64, true),
        ArrowField::new("is_bot", DataType::Boolean, false),
        ArrowField::new("public", DataType::Boolean, false),
        ArrowField::new("hour_bucket", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_col(
                events.iter().map(|e| Some(e.event_hash.clone())).collect(),
            )),
            Arc::new(string_col(
                events.iter().map(|e| Some(e.event_id.clone())).collect(),
            )),
            Arc::new(string_col(
                events.iter().map(|e| Some(e.event_type.clone())).collect(),
            )),
            Arc::new(string_col(
                events
                    .iter()
                    .map(|e| Some(e.created_at.to_rfc3339()))
                    .collect(),
            )),
            Arc::new(Int64Array::from(
                events.iter().map(|e| e.actor_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                events.iter().map(|e| e.repo_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                events.iter().map(|e| e.org_id).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                events.iter().map(|e| e.is_bot).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                events.iter().map(|e| e.public).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(
                events.iter().map(|e| Some(e.hour_bucket.clone())).collect(),
            )),
        ],
    )
    .context("building events record batch")?;
    write_parquet(path, batch)
}

fn write_actors_parquet(path: &Path, actors: &[gharc_core::Actor]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("actor_id", DataType::Int64, false),
        ArrowField::new("login", DataType::Utf8, true),
        ArrowField::new("display_login", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("avatar_url", DataType::Utf8, true),
        ArrowField::new("gravatar_id", DataType::Utf8, true),
        ArrowField::new("actor_type", DataType::Utf8, true),
        ArrowField::new("site_admin", DataType::Boolean, true),
        ArrowField::new("is_bot", DataType::Boolean, true),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                actors.iter().map(|a| Some(a.actor_id)).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(actors.iter().map(|a| a.login.clone()).collect())),
            Arc::new(string_col(
                actors.iter().map(|a| a.display_login.clone()).collect(),
            )),
            Arc::new(string_col(actors.iter().map(|a| a.url.clone()).collect())),
            Arc::new(string_col(
                actors.iter().map(|a| a.avatar_url.clone()).collect(),
            )),
            Arc::new(string_col(
                actors.iter().map(|a| a.gravatar_id.clone()).collect(),
            )),
            Arc::new(string_col(
                actors.iter().map(|a| a.actor_type.clone()).collect(),
            )),
            Arc::new(BooleanArray::from(
                actors.iter().map(|a| a.site_admin).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(
                actors.iter().map(|a| a.is_bot).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(
                actors
                    .iter()
                    .map(|a| Some(a.first_seen_at.to_rfc3339()))
                    .collect(),
            )),
            Arc::new(string_col(
                actors
                    .iter()
                    .map(|a| Some(a.last_seen_at.to_rfc3339()))
                    .collect(),
            )),
        ],
    )
    .context("building actors record batch")?;
    write_parquet(path, batch)
}

fn write_repositories_parquet(path: &Path, repos: &[gharc_core::Repository]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("repo_id", DataType::Int64, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("owner_login", DataType::Utf8, true),
        ArrowField::new("short_name", DataType::Utf8, true),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                repos.iter().map(|r| Some(r.repo_id)).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(repos.iter().map(|r| r.name.clone()).collect())),
            Arc::new(string_col(repos.iter().map(|r| r.url.clone()).collect())),
            Arc::new(string_col(
                repos.iter().map(|r| r.owner_login.clone()).collect(),
            )),
            Arc::new(string_col(
                repos.iter().map(|r| r.short_name.clone()).collect(),
            )),
            Arc::new(string_col(
                repos
                    .iter()
                    .map(|r| Some(r.first_seen_at.to_rfc3339()))
                    .collect(),
            )),
            Arc::new(string_col(
                repos
                    .iter()
                    .map(|r| Some(r.last_seen_at.to_rfc3339()))
                    .collect(),
            )),
        ],
    )
    .context("building repositories record batch")?;
    write_parquet(path, batch)
}

fn write_organizations_parquet(path: &Path, orgs: &[gharc_core::Organization]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("org_id", DataType::Int64, false),
        ArrowField::new("login", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, true),
        ArrowField::new("avatar_url", DataType::Utf8, true),
        ArrowField::new("gravatar_id", DataType::Utf8, true),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                orgs.iter().map(|o| Some(o.org_id)).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(orgs.iter().map(|o| o.login.clone()).collect())),
            Arc::new(string_col(orgs.iter().map(|o| o.url.clone()).collect())),
            Arc::new(string_col(
                orgs.iter().map(|o| o.avatar_url.clone()).collect(),
            )),
            Arc::new(string_col(
                orgs.iter().map(|o| o.gravatar_id.clone()).collect(),
            )),
            Arc::new(string_col(
                orgs.iter()
                    .map(|o| Some(o.first_seen_at.to_rfc3339()))
                    .collect(),
            )),
            Arc::new(string_col(
                orgs.iter()
                    .map(|o| Some(o.last_seen_at.to_rfc3339()))
                    .collect(),
            )),
        ],
    )
    .context("building organizations record batch")?;
    write_parquet(path, batch)
}

fn write_facts_parquet(path: &Path, facts: &[gharc_core::PayloadFact]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("event_id", DataType::Utf8, false),
        ArrowField::new("event_type", DataType::Utf8, false),
        ArrowField::new("action", DataType::Utf8, true),
        ArrowField::new("issue_id", DataType::Int64, true),
        ArrowField::new("pull_request_id", DataType::Int64, true),
        ArrowField::new("comment_id", DataType::Int64, true),
        ArrowField::new("push_size", DataType::Int64, true),
        ArrowField::new("distinct_size", DataType::Int64, true),
        ArrowField::new("ref_name", DataType::Utf8, true),
        ArrowField::new("ref_type", DataType::Utf8, true),
        ArrowField::new("head_sha", DataType::Utf8, true),
        ArrowField::new("before_sha", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_col(
                facts.iter().map(|f| Some(f.event_id.clone())).collect(),
            )),
            Arc::new(string_col(
                facts.iter().map(|f| Some(f.event_type.clone())).collect(),
            )),
            Arc::new(string_col(facts.iter().map(|f| f.action.clone()).collect())),
            Arc::new(Int64Array::from(
                facts.iter().map(|f| f.issue_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                facts.iter().map(|f| f.pull_request_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                facts.iter().map(|f| f.comment_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                facts.iter().map(|f| f.push_size).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                facts.iter().map(|f| f.distinct_size).collect::<Vec<_>>(),
            )),
            Arc::new(string_col(
                facts.iter().map(|f| f.ref_name.clone()).collect(),
            )),
            Arc::new(string_col(
                facts.iter().map(|f| f.ref_type.clone()).collect(),
            )),
            Arc::new(string_col(
                facts.iter().map(|f| f.head_sha.clone()).collect(),
            )),
            Arc::new(string_col(
                facts.iter().map(|f| f.before_sha.clone()).collect(),
            )),
        ],
    )
    .context("building payload_facts record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plan_window_expands_dates_and_filters_hours() {
        let window = ArchiveWindow {
            start_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2015, 1, 2).unwrap(),
            hours: None,
        };
        assert_eq!(plan_window(&window).len(), 48);

        let window = ArchiveWindow {
            hours: Some(vec![0, 12, 23, 99]),
            ..window
        };
        let plan = plan_window(&window);
        assert_eq!(plan.len(), 6);
        assert_eq!(plan[0].file_id(), "2015-01-01-0");
        assert_eq!(plan[5].file_id(), "2015-01-02-23");
    }

    #[test]
    fn archive_manifest_parses_yaml_windows() {
        let manifest: ArchiveManifest = serde_yaml::from_str(concat!(
            "base_url: https://data.gharchive.org\n",
            "windows:\n",
            "  - start_date: 2015-01-01\n",
            "    end_date: 2015-01-01\n",
            "    hours: [15]\n",
            "  - start_date: 2015-01-02\n",
            "    end_date: 2015-01-03\n",
        ))
        .expect("parse manifest");
        assert_eq!(manifest.windows.len(), 2);
        assert_eq!(plan_window(&manifest.windows[0]).len(), 1);
        assert_eq!(plan_window(&manifest.windows[1]).len(), 48);
    }

    #[test]
    fn discovery_walks_nested_directories_in_stable_order() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("2015").join("01");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(nested.join("2015-01-01-15.json.gz"), b"x").expect("write");
        std::fs::write(dir.path().join("2015-01-01-0.json.gz"), b"x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");

        let files = discover_archives(dir.path()).expect("discover");
        let ids: Vec<_> = files.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(ids, vec!["2015-01-01-0", "2015-01-01-15"]);
    }
}
