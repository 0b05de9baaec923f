//! Streaming archive decoding and pure entity extraction.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use gharc_core::{
    ActorObservation, NormalizedEvent, OrgObservation, PayloadFact, RawRecord, RepoObservation,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "gharc-extract";

/// Stable content fingerprint over the fields that define event identity.
/// Upstream ids are not globally unique across archive windows, so the
/// actor/repo ids and timestamp are folded in; absent ids render as `-`.
pub fn fingerprint(
    event_id: &str,
    actor_id: Option<i64>,
    repo_id: Option<i64>,
    created_at: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_id.as_bytes());
    hasher.update(b"/");
    match actor_id {
        Some(id) => hasher.update(id.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher.update(b"/");
    match repo_id {
        Some(id) => hasher.update(id.to_string().as_bytes()),
        None => hasher.update(b"-"),
    }
    hasher.update(b"/");
    hasher.update(created_at.as_bytes());
    hex::encode(hasher.finalize())
}

/// Best-effort bot classification from a login. Heuristic, not ground
/// truth: matches the `[bot]` marker and separator-delimited `bot`
/// fragments, case-insensitively.
pub fn is_bot_login(login: &str) -> bool {
    let lower = login.to_ascii_lowercase();
    lower == "bot"
        || lower.ends_with("[bot]")
        || lower.starts_with("bot-")
        || lower.contains("-bot")
        || lower.contains(".bot")
        || lower.contains("_bot")
        || lower.contains("bot.")
        || lower.contains("bot_")
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawActor {
    pub id: Option<i64>,
    pub login: Option<String>,
    pub display_login: Option<String>,
    pub gravatar_id: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(rename = "type")]
    pub actor_type: Option<String>,
    pub site_admin: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRepo {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrg {
    pub id: Option<i64>,
    pub login: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    pub gravatar_id: Option<String>,
}

/// One upstream event line. `id`, `type` and `created_at` are required;
/// a line missing them is counted as malformed and skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created_at: String,
    pub public: Option<bool>,
    pub actor: Option<RawActor>,
    pub repo: Option<RawRepo>,
    pub org: Option<RawOrg>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl RawEvent {
    pub fn actor_id(&self) -> Option<i64> {
        self.actor.as_ref().and_then(|a| a.id)
    }

    pub fn repo_id(&self) -> Option<i64> {
        self.repo.as_ref().and_then(|r| r.id)
    }

    pub fn org_id(&self) -> Option<i64> {
        self.org.as_ref().and_then(|o| o.id)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.id, self.actor_id(), self.repo_id(), &self.created_at)
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Actor observation, or None when the record carries no actor id.
    pub fn actor_observation(&self) -> Option<ActorObservation> {
        let actor = self.actor.as_ref()?;
        let actor_id = actor.id?;
        let observed_at = self.observed_at()?;
        Some(ActorObservation {
            actor_id,
            login: actor.login.clone(),
            display_login: actor.display_login.clone(),
            url: actor.url.clone(),
            avatar_url: actor.avatar_url.clone(),
            gravatar_id: actor.gravatar_id.clone(),
            actor_type: actor.actor_type.clone(),
            site_admin: actor.site_admin,
            is_bot: actor.login.as_deref().map(is_bot_login),
            observed_at,
        })
    }

    /// Repository observation with the owner login split out of the
    /// `owner/name` full name.
    pub fn repo_observation(&self) -> Option<RepoObservation> {
        let repo = self.repo.as_ref()?;
        let repo_id = repo.id?;
        let observed_at = self.observed_at()?;
        let (owner_login, short_name) = match repo.name.as_deref().and_then(|n| n.split_once('/')) {
            Some((owner, short)) => (Some(owner.to_string()), Some(short.to_string())),
            None => (None, repo.name.clone()),
        };
        Some(RepoObservation {
            repo_id,
            name: repo.name.clone(),
            url: repo.url.clone(),
            owner_login,
            short_name,
            observed_at,
        })
    }

    pub fn org_observation(&self) -> Option<OrgObservation> {
        let org = self.org.as_ref()?;
        let org_id = org.id?;
        let observed_at = self.observed_at()?;
        Some(OrgObservation {
            org_id,
            login: org.login.clone(),
            url: org.url.clone(),
            avatar_url: org.avatar_url.clone(),
            gravatar_id: org.gravatar_id.clone(),
            observed_at,
        })
    }

    /// Normalized event row. None when the upstream timestamp is
    /// unparseable (the raw record still lands in bronze).
    pub fn normalized_event(
        &self,
        event_hash: &str,
        processed_at: DateTime<Utc>,
    ) -> Option<NormalizedEvent> {
        let created_at = self.observed_at()?;
        let is_bot = self
            .actor
            .as_ref()
            .and_then(|a| a.login.as_deref())
            .map(is_bot_login)
            .unwrap_or(false);
        Some(NormalizedEvent {
            event_hash: event_hash.to_string(),
            event_id: self.id.clone(),
            event_type: self.event_type.clone(),
            created_at,
            actor_id: self.actor_id(),
            repo_id: self.repo_id(),
            org_id: self.org_id(),
            is_bot,
            public: self.public.unwrap_or(true),
            hour_bucket: created_at.format("%Y-%m-%d-%H").to_string(),
            processed_at,
        })
    }

    /// Type-specific payload attributes. Fields outside the record's
    /// declared event type stay absent; unknown types yield an
    /// action-only fact.
    pub fn payload_fact(&self) -> PayloadFact {
        let mut fact = PayloadFact {
            event_id: self.id.clone(),
            event_type: self.event_type.clone(),
            action: self.payload_str(&["action"]),
            ..PayloadFact::default()
        };
        match self.event_type.as_str() {
            "IssuesEvent" => {
                fact.issue_id = self.payload_i64(&["issue", "id"]);
            }
            "PullRequestEvent" => {
                fact.pull_request_id = self.payload_i64(&["pull_request", "id"]);
            }
            "IssueCommentEvent" | "CommitCommentEvent" | "PullRequestReviewCommentEvent" => {
                fact.comment_id = self.payload_i64(&["comment", "id"]);
            }
            "PushEvent" => {
                fact.push_size = self.payload_i64(&["size"]);
                fact.distinct_size = self.payload_i64(&["distinct_size"]);
                fact.ref_name = self.payload_str(&["ref"]);
                fact.head_sha = self.payload_str(&["head"]);
                fact.before_sha = self.payload_str(&["before"]);
            }
            "CreateEvent" | "DeleteEvent" => {
                fact.ref_name = self.payload_str(&["ref"]);
                fact.ref_type = self.payload_str(&["ref_type"]);
            }
            _ => {}
        }
        fact
    }

    fn payload_value(&self, path: &[&str]) -> Option<&JsonValue> {
        let mut cur = &self.payload;
        for segment in path {
            cur = cur.get(*segment)?;
        }
        Some(cur)
    }

    fn payload_str(&self, path: &[&str]) -> Option<String> {
        self.payload_value(path)?.as_str().map(ToString::to_string)
    }

    fn payload_i64(&self, path: &[&str]) -> Option<i64> {
        self.payload_value(path)?.as_i64()
    }
}

/// One successfully decoded archive line: the typed event plus the full
/// original document for the bronze audit trail.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub raw: JsonValue,
    pub event: RawEvent,
}

impl DecodedEvent {
    pub fn fingerprint(&self) -> String {
        self.event.fingerprint()
    }

    pub fn to_raw_record(&self, source_file: &str, ingested_at: DateTime<Utc>) -> RawRecord {
        RawRecord {
            fingerprint: self.fingerprint(),
            source_file: source_file.to_string(),
            event_id: self.event.id.clone(),
            event_type: self.event.event_type.clone(),
            created_at: self.event.created_at.clone(),
            raw_payload: self.raw.clone(),
            ingested_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The gzip container itself failed mid-stream; distinct from a
    /// single malformed line, this aborts the file.
    #[error("archive container error at line {line}: {source}")]
    Container {
        line: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Lazy decoder over a gzip-compressed JSON-lines stream. Malformed lines
/// are counted and skipped; memory stays bounded to one line.
pub struct ArchiveDecoder<R: Read> {
    lines: Lines<BufReader<MultiGzDecoder<R>>>,
    line_no: usize,
    decoded: usize,
    skipped: usize,
    failed: bool,
}

impl ArchiveDecoder<File> {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> ArchiveDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(MultiGzDecoder::new(reader)).lines(),
            line_no: 0,
            decoded: 0,
            skipped: 0,
            failed: false,
        }
    }

    /// Lines successfully decoded so far.
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Malformed lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: Read> Iterator for ArchiveDecoder<R> {
    type Item = Result<DecodedEvent, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(source) => {
                    self.failed = true;
                    return Some(Err(DecodeError::Container {
                        line: self.line_no + 1,
                        source,
                    }));
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let raw: JsonValue = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %err, "skipping malformed archive line");
                    continue;
                }
            };
            let event: RawEvent = match serde_json::from_value(raw.clone()) {
                Ok(event) => event,
                Err(err) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %err, "skipping archive line without event identity");
                    continue;
                }
            };
            self.decoded += 1;
            return Some(Ok(DecodedEvent { raw, event }));
        }
    }
}
