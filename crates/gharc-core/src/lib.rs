//! Core domain model for the GHARC medallion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "gharc-core";

/// Processing state of one archive file, tracked by the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl FileStatus {
    /// Terminal states are never re-scanned by a resumed run, except that
    /// `Failed` files may be retried explicitly.
    pub fn is_complete(&self) -> bool {
        matches!(self, FileStatus::Complete)
    }
}

/// One deduplicated raw event as appended to the bronze store.
///
/// Immutable once written; the fingerprint is the primary key and the full
/// upstream document is retained so silver can be rebuilt from bronze alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fingerprint: String,
    pub source_file: String,
    pub event_id: String,
    pub event_type: String,
    /// Upstream timestamp exactly as received; parsed only at the silver stage.
    pub created_at: String,
    pub raw_payload: JsonValue,
    pub ingested_at: DateTime<Utc>,
}

/// Partial view of an actor as seen in one event. Absent fields mean
/// "not observed", never "observed as empty".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorObservation {
    pub actor_id: i64,
    pub login: Option<String>,
    pub display_login: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    pub gravatar_id: Option<String>,
    pub actor_type: Option<String>,
    pub site_admin: Option<bool>,
    /// Best-effort bot classification, derivable only when the login is known.
    pub is_bot: Option<bool>,
    pub observed_at: DateTime<Utc>,
}

/// Partial view of a repository as seen in one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoObservation {
    pub repo_id: i64,
    pub name: Option<String>,
    pub url: Option<String>,
    pub owner_login: Option<String>,
    pub short_name: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Partial view of an organization as seen in one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgObservation {
    pub org_id: i64,
    pub login: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    pub gravatar_id: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Long-lived actor dimension row in the silver store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: i64,
    pub login: Option<String>,
    pub display_login: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    pub gravatar_id: Option<String>,
    pub actor_type: Option<String>,
    pub site_admin: Option<bool>,
    pub is_bot: Option<bool>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Long-lived repository dimension row in the silver store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub repo_id: i64,
    pub name: Option<String>,
    pub url: Option<String>,
    pub owner_login: Option<String>,
    pub short_name: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Long-lived organization dimension row in the silver store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: i64,
    pub login: Option<String>,
    pub url: Option<String>,
    pub avatar_url: Option<String>,
    pub gravatar_id: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One normalized event fact row, 1:1 with a committed [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Content fingerprint of the source record; the row key.
    pub event_hash: String,
    pub event_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub actor_id: Option<i64>,
    pub repo_id: Option<i64>,
    pub org_id: Option<i64>,
    /// Best-effort classification from the actor login; false when unknown.
    pub is_bot: bool,
    pub public: bool,
    /// `YYYY-MM-DD-HH` bucket derived from `created_at`.
    pub hour_bucket: String,
    pub processed_at: DateTime<Utc>,
}

/// Type-specific payload attributes, exactly one row per normalized event.
///
/// Only the fields belonging to the record's declared event type are ever
/// populated; everything else stays absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadFact {
    pub event_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub issue_id: Option<i64>,
    pub pull_request_id: Option<i64>,
    pub comment_id: Option<i64>,
    pub push_size: Option<i64>,
    pub distinct_size: Option<i64>,
    pub ref_name: Option<String>,
    pub ref_type: Option<String>,
    pub head_sha: Option<String>,
    pub before_sha: Option<String>,
}
