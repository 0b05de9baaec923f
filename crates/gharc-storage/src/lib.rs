//! Persistent stores (bronze, silver, checkpoint) and archive fetch utilities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use gharc_core::{
    Actor, FileStatus, NormalizedEvent, Organization, PayloadFact, RawRecord, Repository,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gharc-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write bytes to `path` via a same-directory temp file and an atomic rename.
async fn write_replace(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
    let temp_path = path
        .parent()
        .expect("store path always has parent")
        .join(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

async fn read_json_entry<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_json_entry<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(value).context("serializing store entry")?;
    write_replace(path, &bytes).await
}

async fn scan_json_dir<T: DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();
    for path in paths {
        if let Some(value) = read_json_entry(&path).await? {
            out.push(value);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Bronze store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BronzeError {
    #[error("raw record {0} already appended")]
    DuplicateKey(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Filter for bronze scans; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub source_file: Option<String>,
    pub event_type: Option<String>,
}

impl ScanFilter {
    fn matches(&self, record: &RawRecord) -> bool {
        if let Some(source_file) = &self.source_file {
            if &record.source_file != source_file {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &record.event_type != event_type {
                return false;
            }
        }
        true
    }
}

/// Append-only raw record storage keyed by content fingerprint.
#[async_trait]
pub trait BronzeStore: Send + Sync {
    /// Append one record; fails with [`BronzeError::DuplicateKey`] if the
    /// fingerprint is already stored. Callers are expected to have claimed
    /// the fingerprint with the checkpoint store first.
    async fn append(&self, record: &RawRecord) -> Result<(), BronzeError>;
    async fn contains(&self, fingerprint: &str) -> anyhow::Result<bool>;
    async fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<RawRecord>>;
    async fn count(&self) -> anyhow::Result<usize>;
}

/// Filesystem bronze store with a content-addressed layout:
/// `<root>/<fp[0..2]>/<fingerprint>.json`, written immutably.
#[derive(Debug, Clone)]
pub struct FsBronzeStore {
    root: PathBuf,
}

impl FsBronzeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        let shard = if fingerprint.len() >= 2 {
            &fingerprint[..2]
        } else {
            "xx"
        };
        self.root.join(shard).join(format!("{fingerprint}.json"))
    }
}

#[async_trait]
impl BronzeStore for FsBronzeStore {
    async fn append(&self, record: &RawRecord) -> Result<(), BronzeError> {
        let path = self.record_path(&record.fingerprint);
        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking bronze path {}", path.display()))?;
        if exists {
            return Err(BronzeError::DuplicateKey(record.fingerprint.clone()));
        }
        // Same fingerprint implies same content, so a lost rename race
        // rewrites identical bytes.
        write_json_entry(&path, record).await?;
        Ok(())
    }

    async fn contains(&self, fingerprint: &str) -> anyhow::Result<bool> {
        let path = self.record_path(fingerprint);
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking bronze path {}", path.display()))
    }

    async fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<RawRecord>> {
        let mut out = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };
        let mut shard_dirs = Vec::new();
        while let Some(entry) = shards
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            if entry
                .file_type()
                .await
                .with_context(|| format!("inspecting {}", entry.path().display()))?
                .is_dir()
            {
                shard_dirs.push(entry.path());
            }
        }
        shard_dirs.sort();
        for shard in shard_dirs {
            for record in scan_json_dir::<RawRecord>(&shard).await? {
                if filter.matches(&record) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.scan(&ScanFilter::default()).await?.len())
    }
}

/// In-memory bronze store backing scheduler and merge tests.
#[derive(Debug, Default)]
pub struct MemBronzeStore {
    records: Mutex<BTreeMap<String, RawRecord>>,
}

impl MemBronzeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BronzeStore for MemBronzeStore {
    async fn append(&self, record: &RawRecord) -> Result<(), BronzeError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.fingerprint) {
            return Err(BronzeError::DuplicateKey(record.fingerprint.clone()));
        }
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn contains(&self, fingerprint: &str) -> anyhow::Result<bool> {
        Ok(self.records.lock().await.contains_key(fingerprint))
    }

    async fn scan(&self, filter: &ScanFilter) -> anyhow::Result<Vec<RawRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.records.lock().await.len())
    }
}

// ---------------------------------------------------------------------------
// Silver store
// ---------------------------------------------------------------------------

/// Keyed, mutable silver storage. Upserts are atomic whole-row replaces;
/// the merge engine is the only writer.
#[async_trait]
pub trait SilverStore: Send + Sync {
    async fn get_actor(&self, actor_id: i64) -> anyhow::Result<Option<Actor>>;
    async fn upsert_actor(&self, actor: &Actor) -> anyhow::Result<()>;
    async fn scan_actors(&self) -> anyhow::Result<Vec<Actor>>;

    async fn get_repository(&self, repo_id: i64) -> anyhow::Result<Option<Repository>>;
    async fn upsert_repository(&self, repo: &Repository) -> anyhow::Result<()>;
    async fn scan_repositories(&self) -> anyhow::Result<Vec<Repository>>;

    async fn get_organization(&self, org_id: i64) -> anyhow::Result<Option<Organization>>;
    async fn upsert_organization(&self, org: &Organization) -> anyhow::Result<()>;
    async fn scan_organizations(&self) -> anyhow::Result<Vec<Organization>>;

    async fn get_event(&self, event_hash: &str) -> anyhow::Result<Option<NormalizedEvent>>;
    async fn upsert_event(&self, event: &NormalizedEvent) -> anyhow::Result<()>;
    async fn scan_events(&self) -> anyhow::Result<Vec<NormalizedEvent>>;

    async fn get_fact(&self, event_id: &str) -> anyhow::Result<Option<PayloadFact>>;
    async fn upsert_fact(&self, fact: &PayloadFact) -> anyhow::Result<()>;
    async fn scan_facts(&self) -> anyhow::Result<Vec<PayloadFact>>;
}

/// Filesystem silver store: one JSON document per row under
/// `<root>/<table>/<key>.json`, replaced atomically on upsert.
#[derive(Debug, Clone)]
pub struct FsSilverStore {
    root: PathBuf,
}

impl FsSilverStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn row_path(&self, table: &str, key: &str) -> PathBuf {
        self.table(table).join(format!("{key}.json"))
    }
}

#[async_trait]
impl SilverStore for FsSilverStore {
    async fn get_actor(&self, actor_id: i64) -> anyhow::Result<Option<Actor>> {
        read_json_entry(&self.row_path("actors", &actor_id.to_string())).await
    }

    async fn upsert_actor(&self, actor: &Actor) -> anyhow::Result<()> {
        write_json_entry(&self.row_path("actors", &actor.actor_id.to_string()), actor).await
    }

    async fn scan_actors(&self) -> anyhow::Result<Vec<Actor>> {
        scan_json_dir(&self.table("actors")).await
    }

    async fn get_repository(&self, repo_id: i64) -> anyhow::Result<Option<Repository>> {
        read_json_entry(&self.row_path("repositories", &repo_id.to_string())).await
    }

    async fn upsert_repository(&self, repo: &Repository) -> anyhow::Result<()> {
        write_json_entry(
            &self.row_path("repositories", &repo.repo_id.to_string()),
            repo,
        )
        .await
    }

    async fn scan_repositories(&self) -> anyhow::Result<Vec<Repository>> {
        scan_json_dir(&self.table("repositories")).await
    }

    async fn get_organization(&self, org_id: i64) -> anyhow::Result<Option<Organization>> {
        read_json_entry(&self.row_path("organizations", &org_id.to_string())).await
    }

    async fn upsert_organization(&self, org: &Organization) -> anyhow::Result<()> {
        write_json_entry(
            &self.row_path("organizations", &org.org_id.to_string()),
            org,
        )
        .await
    }

    async fn scan_organizations(&self) -> anyhow::Result<Vec<Organization>> {
        scan_json_dir(&self.table("organizations")).await
    }

    async fn get_event(&self, event_hash: &str) -> anyhow::Result<Option<NormalizedEvent>> {
        read_json_entry(&self.row_path("events", event_hash)).await
    }

    async fn upsert_event(&self, event: &NormalizedEvent) -> anyhow::Result<()> {
        write_json_entry(&self.row_path("events", &event.event_hash), event).await
    }

    async fn scan_events(&self) -> anyhow::Result<Vec<NormalizedEvent>> {
        scan_json_dir(&self.table("events")).await
    }

    async fn get_fact(&self, event_id: &str) -> anyhow::Result<Option<PayloadFact>> {
        read_json_entry(&self.row_path("payload_facts", event_id)).await
    }

    async fn upsert_fact(&self, fact: &PayloadFact) -> anyhow::Result<()> {
        write_json_entry(&self.row_path("payload_facts", &fact.event_id), fact).await
    }

    async fn scan_facts(&self) -> anyhow::Result<Vec<PayloadFact>> {
        scan_json_dir(&self.table("payload_facts")).await
    }
}

/// In-memory silver store for tests.
#[derive(Debug, Default)]
pub struct MemSilverStore {
    actors: Mutex<BTreeMap<i64, Actor>>,
    repositories: Mutex<BTreeMap<i64, Repository>>,
    organizations: Mutex<BTreeMap<i64, Organization>>,
    events: Mutex<BTreeMap<String, NormalizedEvent>>,
    facts: Mutex<BTreeMap<String, PayloadFact>>,
}

impl MemSilverStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SilverStore for MemSilverStore {
    async fn get_actor(&self, actor_id: i64) -> anyhow::Result<Option<Actor>> {
        Ok(self.actors.lock().await.get(&actor_id).cloned())
    }

    async fn upsert_actor(&self, actor: &Actor) -> anyhow::Result<()> {
        self.actors
            .lock()
            .await
            .insert(actor.actor_id, actor.clone());
        Ok(())
    }

    async fn scan_actors(&self) -> anyhow::Result<Vec<Actor>> {
        Ok(self.actors.lock().await.values().cloned().collect())
    }

    async fn get_repository(&self, repo_id: i64) -> anyhow::Result<Option<Repository>> {
        Ok(self.repositories.lock().await.get(&repo_id).cloned())
    }

    async fn upsert_repository(&self, repo: &Repository) -> anyhow::Result<()> {
        self.repositories
            .lock()
            .await
            .insert(repo.repo_id, repo.clone());
        Ok(())
    }

    async fn scan_repositories(&self) -> anyhow::Result<Vec<Repository>> {
        Ok(self.repositories.lock().await.values().cloned().collect())
    }

    async fn get_organization(&self, org_id: i64) -> anyhow::Result<Option<Organization>> {
        Ok(self.organizations.lock().await.get(&org_id).cloned())
    }

    async fn upsert_organization(&self, org: &Organization) -> anyhow::Result<()> {
        self.organizations
            .lock()
            .await
            .insert(org.org_id, org.clone());
        Ok(())
    }

    async fn scan_organizations(&self) -> anyhow::Result<Vec<Organization>> {
        Ok(self.organizations.lock().await.values().cloned().collect())
    }

    async fn get_event(&self, event_hash: &str) -> anyhow::Result<Option<NormalizedEvent>> {
        Ok(self.events.lock().await.get(event_hash).cloned())
    }

    async fn upsert_event(&self, event: &NormalizedEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .await
            .insert(event.event_hash.clone(), event.clone());
        Ok(())
    }

    async fn scan_events(&self) -> anyhow::Result<Vec<NormalizedEvent>> {
        Ok(self.events.lock().await.values().cloned().collect())
    }

    async fn get_fact(&self, event_id: &str) -> anyhow::Result<Option<PayloadFact>> {
        Ok(self.facts.lock().await.get(event_id).cloned())
    }

    async fn upsert_fact(&self, fact: &PayloadFact) -> anyhow::Result<()> {
        self.facts
            .lock()
            .await
            .insert(fact.event_id.clone(), fact.clone());
        Ok(())
    }

    async fn scan_facts(&self) -> anyhow::Result<Vec<PayloadFact>> {
        Ok(self.facts.lock().await.values().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint store / dedup key index
// ---------------------------------------------------------------------------

/// Per-file processing status plus the committed-fingerprint index.
///
/// `claim` is the atomic check-and-set half of deduplication; `commit` is
/// called only after the record was durably appended to bronze. A claim
/// whose append failed must be released so a retry can re-claim it.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn status(&self, file_id: &str) -> anyhow::Result<FileStatus>;
    async fn set_status(&self, file_id: &str, status: FileStatus) -> anyhow::Result<()>;

    /// Atomically mark a fingerprint in-flight. Returns false when it is
    /// already committed or already claimed by another worker.
    async fn claim(&self, fingerprint: &str) -> anyhow::Result<bool>;
    async fn commit(&self, fingerprint: &str, file_id: &str) -> anyhow::Result<()>;
    async fn release(&self, fingerprint: &str) -> anyhow::Result<()>;
    async fn committed_count(&self) -> anyhow::Result<usize>;
}

#[derive(Debug, Default)]
struct CheckpointState {
    statuses: HashMap<String, FileStatus>,
    committed: HashSet<String>,
    claimed: HashSet<String>,
}

/// Filesystem checkpoint store: a status map rewritten atomically on every
/// transition plus an append-only fingerprint journal hydrated at open.
#[derive(Debug)]
pub struct FsCheckpointStore {
    status_path: PathBuf,
    journal_path: PathBuf,
    state: Mutex<CheckpointState>,
}

impl FsCheckpointStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating checkpoint directory {}", root.display()))?;
        let status_path = root.join("file_status.json");
        let journal_path = root.join("fingerprints.log");

        let statuses: HashMap<String, FileStatus> =
            read_json_entry(&status_path).await?.unwrap_or_default();
        let mut committed = HashSet::new();
        match fs::read_to_string(&journal_path).await {
            Ok(journal) => {
                for line in journal.lines() {
                    if let Some(fingerprint) = line.split_whitespace().next() {
                        committed.insert(fingerprint.to_string());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading journal {}", journal_path.display()))
            }
        }

        Ok(Self {
            status_path,
            journal_path,
            state: Mutex::new(CheckpointState {
                statuses,
                committed,
                claimed: HashSet::new(),
            }),
        })
    }

    async fn persist_statuses(&self, statuses: &HashMap<String, FileStatus>) -> anyhow::Result<()> {
        write_json_entry(&self.status_path, statuses).await
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn status(&self, file_id: &str) -> anyhow::Result<FileStatus> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .get(file_id)
            .copied()
            .unwrap_or(FileStatus::Pending))
    }

    async fn set_status(&self, file_id: &str, status: FileStatus) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.statuses.insert(file_id.to_string(), status);
        self.persist_statuses(&state.statuses).await
    }

    async fn claim(&self, fingerprint: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if state.committed.contains(fingerprint) || state.claimed.contains(fingerprint) {
            return Ok(false);
        }
        state.claimed.insert(fingerprint.to_string());
        Ok(true)
    }

    async fn commit(&self, fingerprint: &str, file_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.claimed.remove(fingerprint);
        if !state.committed.insert(fingerprint.to_string()) {
            return Ok(());
        }
        let mut journal = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.journal_path)
            .await
            .with_context(|| format!("opening journal {}", self.journal_path.display()))?;
        journal
            .write_all(format!("{fingerprint} {file_id}\n").as_bytes())
            .await
            .with_context(|| format!("appending journal {}", self.journal_path.display()))?;
        journal
            .flush()
            .await
            .with_context(|| format!("flushing journal {}", self.journal_path.display()))?;
        Ok(())
    }

    async fn release(&self, fingerprint: &str) -> anyhow::Result<()> {
        self.state.lock().await.claimed.remove(fingerprint);
        Ok(())
    }

    async fn committed_count(&self) -> anyhow::Result<usize> {
        Ok(self.state.lock().await.committed.len())
    }
}

/// In-memory checkpoint store for scheduler tests.
#[derive(Debug, Default)]
pub struct MemCheckpointStore {
    state: Mutex<CheckpointState>,
}

impl MemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemCheckpointStore {
    async fn status(&self, file_id: &str) -> anyhow::Result<FileStatus> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .get(file_id)
            .copied()
            .unwrap_or(FileStatus::Pending))
    }

    async fn set_status(&self, file_id: &str, status: FileStatus) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .statuses
            .insert(file_id.to_string(), status);
        Ok(())
    }

    async fn claim(&self, fingerprint: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        if state.committed.contains(fingerprint) || state.claimed.contains(fingerprint) {
            return Ok(false);
        }
        state.claimed.insert(fingerprint.to_string());
        Ok(true)
    }

    async fn commit(&self, fingerprint: &str, _file_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.claimed.remove(fingerprint);
        state.committed.insert(fingerprint.to_string());
        Ok(())
    }

    async fn release(&self, fingerprint: &str) -> anyhow::Result<()> {
        self.state.lock().await.claimed.remove(fingerprint);
        Ok(())
    }

    async fn committed_count(&self) -> anyhow::Result<usize> {
        Ok(self.state.lock().await.committed.len())
    }
}

// ---------------------------------------------------------------------------
// Archive fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff shared by the fetcher and per-file pipeline retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// One hourly archive file in the upstream naming scheme, e.g.
/// `2015-01-01-15.json.gz` (hours are not zero-padded upstream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHour {
    pub date: NaiveDate,
    pub hour: u32,
}

impl ArchiveHour {
    pub fn file_id(&self) -> String {
        format!("{}-{}", self.date.format("%Y-%m-%d"), self.hour)
    }

    pub fn file_name(&self) -> String {
        format!("{}.json.gz", self.file_id())
    }

    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.file_name())
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloaded,
    AlreadyPresent,
    /// The upstream archive has gaps; a 404 hour is recorded, not fatal.
    Missing,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_id: String,
    pub path: Option<PathBuf>,
    pub content_hash: Option<String>,
    pub byte_size: usize,
    pub status: DownloadStatus,
}

/// HTTP downloader for hourly archive files: bounded concurrency, optional
/// token-bucket politeness, exponential backoff on retryable failures.
#[derive(Debug)]
pub struct ArchiveFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
    backoff: BackoffPolicy,
}

impl ArchiveFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(TokenBucket::new(c.capacity, c.refill_every)));
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("archive_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Download one archive hour into `dest_dir`, skipping files already on
    /// disk and treating an upstream 404 as a recorded gap.
    pub async fn download_archive(
        &self,
        run_id: Uuid,
        base_url: &str,
        hour: ArchiveHour,
        dest_dir: &Path,
    ) -> anyhow::Result<DownloadOutcome> {
        let file_id = hour.file_id();
        let dest = dest_dir.join(hour.file_name());
        if fs::try_exists(&dest)
            .await
            .with_context(|| format!("checking archive path {}", dest.display()))?
        {
            return Ok(DownloadOutcome {
                file_id,
                path: Some(dest),
                content_hash: None,
                byte_size: 0,
                status: DownloadStatus::AlreadyPresent,
            });
        }

        let url = hour.url(base_url);
        match self.fetch_bytes(run_id, &url).await {
            Ok(resp) => {
                let content_hash = sha256_hex(&resp.body);
                let byte_size = resp.body.len();
                write_replace(&dest, &resp.body).await?;
                Ok(DownloadOutcome {
                    file_id,
                    path: Some(dest),
                    content_hash: Some(content_hash),
                    byte_size,
                    status: DownloadStatus::Downloaded,
                })
            }
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(DownloadOutcome {
                file_id,
                path: None,
                content_hash: None,
                byte_size: 0,
                status: DownloadStatus::Missing,
            }),
            Err(err) => Err(err).with_context(|| format!("downloading {url}")),
        }
    }
}
