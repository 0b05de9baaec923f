//! Incremental merge engine: batch aggregation plus coalesce-forward
//! entity merges, serialized per identity key.
//!
//! Merge policy: temporal bounds are min/max folds (order- and
//! partition-independent); every other attribute keeps the first stored
//! known value and only fills in unknowns. This deliberately differs from
//! last-writer-wins: a previously known attribute is never overwritten,
//! not even by a different known value.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gharc_core::{
    Actor, ActorObservation, NormalizedEvent, Organization, OrgObservation, PayloadFact,
    RepoObservation, Repository,
};
use gharc_extract::RawEvent;
use gharc_storage::SilverStore;
use serde::Serialize;
use tokio::sync::Mutex;

/// Batch resolution state for one attribute: the known value carried by
/// the latest observation, ties resolved to the later input position.
struct Latest<T> {
    at: Option<DateTime<Utc>>,
    value: Option<T>,
}

impl<T> Latest<T> {
    fn new() -> Self {
        Self {
            at: None,
            value: None,
        }
    }

    fn offer(&mut self, at: DateTime<Utc>, value: Option<T>) {
        if let Some(value) = value {
            if self.at.map_or(true, |current| at >= current) {
                self.at = Some(at);
                self.value = Some(value);
            }
        }
    }

    fn resolve(self) -> Option<T> {
        self.value
    }
}

/// Coalesce-forward: the stored side wins whenever it is known.
fn coalesce<T>(stored: Option<T>, incoming: Option<T>) -> Option<T> {
    stored.or(incoming)
}

/// Merge a batch of same-key actor observations into the stored state.
/// Returns None for an empty batch.
pub fn merge_actor(previous: Option<Actor>, batch: &[ActorObservation]) -> Option<Actor> {
    let first = batch.first()?;
    let mut batch_first = first.observed_at;
    let mut batch_last = first.observed_at;
    let mut login = Latest::new();
    let mut display_login = Latest::new();
    let mut url = Latest::new();
    let mut avatar_url = Latest::new();
    let mut gravatar_id = Latest::new();
    let mut actor_type = Latest::new();
    let mut site_admin = Latest::new();
    let mut is_bot = Latest::new();

    for obs in batch {
        batch_first = batch_first.min(obs.observed_at);
        batch_last = batch_last.max(obs.observed_at);
        login.offer(obs.observed_at, obs.login.clone());
        display_login.offer(obs.observed_at, obs.display_login.clone());
        url.offer(obs.observed_at, obs.url.clone());
        avatar_url.offer(obs.observed_at, obs.avatar_url.clone());
        gravatar_id.offer(obs.observed_at, obs.gravatar_id.clone());
        actor_type.offer(obs.observed_at, obs.actor_type.clone());
        site_admin.offer(obs.observed_at, obs.site_admin);
        is_bot.offer(obs.observed_at, obs.is_bot);
    }

    Some(match previous {
        Some(prev) => Actor {
            actor_id: prev.actor_id,
            login: coalesce(prev.login, login.resolve()),
            display_login: coalesce(prev.display_login, display_login.resolve()),
            url: coalesce(prev.url, url.resolve()),
            avatar_url: coalesce(prev.avatar_url, avatar_url.resolve()),
            gravatar_id: coalesce(prev.gravatar_id, gravatar_id.resolve()),
            actor_type: coalesce(prev.actor_type, actor_type.resolve()),
            site_admin: coalesce(prev.site_admin, site_admin.resolve()),
            is_bot: coalesce(prev.is_bot, is_bot.resolve()),
            first_seen_at: prev.first_seen_at.min(batch_first),
            last_seen_at: prev.last_seen_at.max(batch_last),
        },
        None => Actor {
            actor_id: first.actor_id,
            login: login.resolve(),
            display_login: display_login.resolve(),
            url: url.resolve(),
            avatar_url: avatar_url.resolve(),
            gravatar_id: gravatar_id.resolve(),
            actor_type: actor_type.resolve(),
            site_admin: site_admin.resolve(),
            is_bot: is_bot.resolve(),
            first_seen_at: batch_first,
            last_seen_at: batch_last,
        },
    })
}

pub fn merge_repository(
    previous: Option<Repository>,
    batch: &[RepoObservation],
) -> Option<Repository> {
    let first = batch.first()?;
    let mut batch_first = first.observed_at;
    let mut batch_last = first.observed_at;
    let mut name = Latest::new();
    let mut url = Latest::new();
    let mut owner_login = Latest::new();
    let mut short_name = Latest::new();

    for obs in batch {
        batch_first = batch_first.min(obs.observed_at);
        batch_last = batch_last.max(obs.observed_at);
        name.offer(obs.observed_at, obs.name.clone());
        url.offer(obs.observed_at, obs.url.clone());
        owner_login.offer(obs.observed_at, obs.owner_login.clone());
        short_name.offer(obs.observed_at, obs.short_name.clone());
    }

    Some(match previous {
        Some(prev) => Repository {
            repo_id: prev.repo_id,
            name: coalesce(prev.name, name.resolve()),
            url: coalesce(prev.url, url.resolve()),
            owner_login: coalesce(prev.owner_login, owner_login.resolve()),
            short_name: coalesce(prev.short_name, short_name.resolve()),
            first_seen_at: prev.first_seen_at.min(batch_first),
            last_seen_at: prev.last_seen_at.max(batch_last),
        },
        None => Repository {
            repo_id: first.repo_id,
            name: name.resolve(),
            url: url.resolve(),
            owner_login: owner_login.resolve(),
            short_name: short_name.resolve(),
            first_seen_at: batch_first,
            last_seen_at: batch_last,
        },
    })
}

pub fn merge_organization(
    previous: Option<Organization>,
    batch: &[OrgObservation],
) -> Option<Organization> {
    let first = batch.first()?;
    let mut batch_first = first.observed_at;
    let mut batch_last = first.observed_at;
    let mut login = Latest::new();
    let mut url = Latest::new();
    let mut avatar_url = Latest::new();
    let mut gravatar_id = Latest::new();

    for obs in batch {
        batch_first = batch_first.min(obs.observed_at);
        batch_last = batch_last.max(obs.observed_at);
        login.offer(obs.observed_at, obs.login.clone());
        url.offer(obs.observed_at, obs.url.clone());
        avatar_url.offer(obs.observed_at, obs.avatar_url.clone());
        gravatar_id.offer(obs.observed_at, obs.gravatar_id.clone());
    }

    Some(match previous {
        Some(prev) => Organization {
            org_id: prev.org_id,
            login: coalesce(prev.login, login.resolve()),
            url: coalesce(prev.url, url.resolve()),
            avatar_url: coalesce(prev.avatar_url, avatar_url.resolve()),
            gravatar_id: coalesce(prev.gravatar_id, gravatar_id.resolve()),
            first_seen_at: prev.first_seen_at.min(batch_first),
            last_seen_at: prev.last_seen_at.max(batch_last),
        },
        None => Organization {
            org_id: first.org_id,
            login: login.resolve(),
            url: url.resolve(),
            avatar_url: avatar_url.resolve(),
            gravatar_id: gravatar_id.resolve(),
            first_seen_at: batch_first,
            last_seen_at: batch_last,
        },
    })
}

/// Normalized events are written once and only backfilled: previously
/// unextractable reference ids may fill in, everything else is kept.
pub fn merge_event(previous: Option<NormalizedEvent>, incoming: NormalizedEvent) -> NormalizedEvent {
    match previous {
        None => incoming,
        Some(prev) => NormalizedEvent {
            actor_id: coalesce(prev.actor_id, incoming.actor_id),
            repo_id: coalesce(prev.repo_id, incoming.repo_id),
            org_id: coalesce(prev.org_id, incoming.org_id),
            ..prev
        },
    }
}

pub fn merge_fact(previous: Option<PayloadFact>, incoming: PayloadFact) -> PayloadFact {
    match previous {
        None => incoming,
        Some(prev) => PayloadFact {
            event_id: prev.event_id,
            event_type: prev.event_type,
            action: coalesce(prev.action, incoming.action),
            issue_id: coalesce(prev.issue_id, incoming.issue_id),
            pull_request_id: coalesce(prev.pull_request_id, incoming.pull_request_id),
            comment_id: coalesce(prev.comment_id, incoming.comment_id),
            push_size: coalesce(prev.push_size, incoming.push_size),
            distinct_size: coalesce(prev.distinct_size, incoming.distinct_size),
            ref_name: coalesce(prev.ref_name, incoming.ref_name),
            ref_type: coalesce(prev.ref_type, incoming.ref_type),
            head_sha: coalesce(prev.head_sha, incoming.head_sha),
            before_sha: coalesce(prev.before_sha, incoming.before_sha),
        },
    }
}

/// Per-file local aggregation of observations, grouped by identity key so
/// one merge applies per entity.
#[derive(Debug, Default)]
pub struct ObservationBatches {
    pub actors: HashMap<i64, Vec<ActorObservation>>,
    pub repositories: HashMap<i64, Vec<RepoObservation>>,
    pub organizations: HashMap<i64, Vec<OrgObservation>>,
    pub events: Vec<NormalizedEvent>,
    pub facts: Vec<PayloadFact>,
}

impl ObservationBatches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one decoded event into the local batches. Returns false when
    /// the upstream timestamp does not parse and nothing could be
    /// extracted for silver (the raw record still lives in bronze).
    pub fn record(
        &mut self,
        fingerprint: &str,
        event: &RawEvent,
        processed_at: DateTime<Utc>,
    ) -> bool {
        let Some(normalized) = event.normalized_event(fingerprint, processed_at) else {
            return false;
        };
        if let Some(obs) = event.actor_observation() {
            self.actors.entry(obs.actor_id).or_default().push(obs);
        }
        if let Some(obs) = event.repo_observation() {
            self.repositories.entry(obs.repo_id).or_default().push(obs);
        }
        if let Some(obs) = event.org_observation() {
            self.organizations.entry(obs.org_id).or_default().push(obs);
        }
        self.facts.push(event.payload_fact());
        self.events.push(normalized);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
            && self.repositories.is_empty()
            && self.organizations.is_empty()
            && self.events.is_empty()
            && self.facts.is_empty()
    }
}

/// Upsert counts from one merge application.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MergeStats {
    pub actors: usize,
    pub repositories: usize,
    pub organizations: usize,
    pub events: usize,
    pub payload_facts: usize,
}

impl MergeStats {
    pub fn absorb(&mut self, other: MergeStats) {
        self.actors += other.actors;
        self.repositories += other.repositories;
        self.organizations += other.organizations;
        self.events += other.events;
        self.payload_facts += other.payload_facts;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GuardKey {
    Actor(i64),
    Repository(i64),
    Organization(i64),
    Event(String),
    Fact(String),
}

/// Sole writer of the silver store. Merges for the same identity key are
/// serialized through a keyed-guard map; disjoint keys proceed
/// concurrently without any global lock.
pub struct MergeEngine {
    silver: Arc<dyn SilverStore>,
    guards: Mutex<HashMap<GuardKey, Arc<Mutex<()>>>>,
}

impl MergeEngine {
    pub fn new(silver: Arc<dyn SilverStore>) -> Self {
        Self {
            silver,
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn silver(&self) -> &Arc<dyn SilverStore> {
        &self.silver
    }

    async fn guard(&self, key: GuardKey) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a guard entry once no in-flight merge holds it.
    async fn prune_guard(&self, key: &GuardKey) {
        let mut guards = self.guards.lock().await;
        if let Some(existing) = guards.get(key) {
            if Arc::strong_count(existing) == 1 {
                guards.remove(key);
            }
        }
    }

    /// Apply one file's batches: a single logical upsert per identity key.
    pub async fn apply(&self, batches: ObservationBatches) -> anyhow::Result<MergeStats> {
        let mut stats = MergeStats::default();

        for (actor_id, batch) in batches.actors {
            let key = GuardKey::Actor(actor_id);
            let guard = self.guard(key.clone()).await;
            {
                let _serialized = guard.lock().await;
                let previous = self.silver.get_actor(actor_id).await?;
                if let Some(next) = merge_actor(previous, &batch) {
                    self.silver.upsert_actor(&next).await?;
                    stats.actors += 1;
                }
            }
            drop(guard);
            self.prune_guard(&key).await;
        }

        for (repo_id, batch) in batches.repositories {
            let key = GuardKey::Repository(repo_id);
            let guard = self.guard(key.clone()).await;
            {
                let _serialized = guard.lock().await;
                let previous = self.silver.get_repository(repo_id).await?;
                if let Some(next) = merge_repository(previous, &batch) {
                    self.silver.upsert_repository(&next).await?;
                    stats.repositories += 1;
                }
            }
            drop(guard);
            self.prune_guard(&key).await;
        }

        for (org_id, batch) in batches.organizations {
            let key = GuardKey::Organization(org_id);
            let guard = self.guard(key.clone()).await;
            {
                let _serialized = guard.lock().await;
                let previous = self.silver.get_organization(org_id).await?;
                if let Some(next) = merge_organization(previous, &batch) {
                    self.silver.upsert_organization(&next).await?;
                    stats.organizations += 1;
                }
            }
            drop(guard);
            self.prune_guard(&key).await;
        }

        for event in batches.events {
            let key = GuardKey::Event(event.event_hash.clone());
            let guard = self.guard(key.clone()).await;
            {
                let _serialized = guard.lock().await;
                let previous = self.silver.get_event(&event.event_hash).await?;
                let next = merge_event(previous, event);
                self.silver.upsert_event(&next).await?;
                stats.events += 1;
            }
            drop(guard);
            self.prune_guard(&key).await;
        }

        for fact in batches.facts {
            let key = GuardKey::Fact(fact.event_id.clone());
            let guard = self.guard(key.clone()).await;
            {
                let _serialized = guard.lock().await;
                let previous = self.silver.get_fact(&fact.event_id).await?;
                let next = merge_fact(previous, fact);
                self.silver.upsert_fact(&next).await?;
                stats.payload_facts += 1;
            }
            drop(guard);
            self.prune_guard(&key).await;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gharc_storage::MemSilverStore;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 1, 1, hour, minute, 0)
            .single()
            .unwrap()
    }

    fn obs(actor_id: i64, observed_at: DateTime<Utc>) -> ActorObservation {
        ActorObservation {
            actor_id,
            login: None,
            display_login: None,
            url: None,
            avatar_url: None,
            gravatar_id: None,
            actor_type: None,
            site_admin: None,
            is_bot: None,
            observed_at,
        }
    }

    #[test]
    fn later_observation_fills_in_fields_and_widens_bounds_backward() {
        // Scenario: login-only observation first, then an earlier, richer one.
        let first = ActorObservation {
            login: Some("alice".to_string()),
            is_bot: Some(false),
            ..obs(1, ts(15, 0))
        };
        let merged = merge_actor(None, &[first]).expect("seed");
        assert_eq!(merged.login.as_deref(), Some("alice"));
        assert_eq!(merged.first_seen_at, ts(15, 0));

        let earlier = ActorObservation {
            login: Some("alice".to_string()),
            actor_type: Some("User".to_string()),
            is_bot: Some(false),
            ..obs(1, ts(9, 0))
        };
        let merged = merge_actor(Some(merged), &[earlier]).expect("merge");
        assert_eq!(merged.login.as_deref(), Some("alice"));
        assert_eq!(merged.actor_type.as_deref(), Some("User"));
        assert_eq!(merged.first_seen_at, ts(9, 0));
        assert_eq!(merged.last_seen_at, ts(15, 0));
    }

    #[test]
    fn stored_values_are_never_overwritten_or_unset() {
        let seed = ActorObservation {
            login: Some("alice".to_string()),
            url: Some("https://api.github.com/users/alice".to_string()),
            ..obs(1, ts(10, 0))
        };
        let stored = merge_actor(None, &[seed]).expect("seed");

        // A later batch with a conflicting login and an absent url changes neither.
        let conflicting = ActorObservation {
            login: Some("mallory".to_string()),
            ..obs(1, ts(12, 0))
        };
        let merged = merge_actor(Some(stored.clone()), &[conflicting]).expect("merge");
        assert_eq!(merged.login.as_deref(), Some("alice"));
        assert_eq!(merged.url, stored.url);
        assert_eq!(merged.last_seen_at, ts(12, 0));
    }

    #[test]
    fn batch_resolution_prefers_the_latest_observation() {
        let batch = vec![
            ActorObservation {
                display_login: Some("old".to_string()),
                ..obs(1, ts(8, 0))
            },
            ActorObservation {
                display_login: Some("new".to_string()),
                ..obs(1, ts(11, 0))
            },
            obs(1, ts(13, 0)),
        ];
        let merged = merge_actor(None, &batch).expect("merge");
        assert_eq!(merged.display_login.as_deref(), Some("new"));
        assert_eq!(merged.first_seen_at, ts(8, 0));
        assert_eq!(merged.last_seen_at, ts(13, 0));
    }

    #[test]
    fn merging_is_invariant_over_batch_order_and_boundaries() {
        let observations = vec![
            ActorObservation {
                login: Some("alice".to_string()),
                ..obs(1, ts(9, 0))
            },
            ActorObservation {
                login: Some("alice".to_string()),
                actor_type: Some("User".to_string()),
                ..obs(1, ts(11, 0))
            },
            ActorObservation {
                url: Some("https://api.github.com/users/alice".to_string()),
                ..obs(1, ts(7, 0))
            },
            ActorObservation {
                site_admin: Some(false),
                ..obs(1, ts(14, 0))
            },
        ];

        // Every partition of the observation set into ordered batches must
        // converge to the same entity.
        let partitions: Vec<Vec<Vec<usize>>> = vec![
            vec![vec![0, 1, 2, 3]],
            vec![vec![3, 2, 1, 0]],
            vec![vec![0], vec![1], vec![2], vec![3]],
            vec![vec![3], vec![2], vec![1], vec![0]],
            vec![vec![1, 3], vec![0, 2]],
            vec![vec![2, 0], vec![3], vec![1]],
        ];

        let mut results = Vec::new();
        for partition in partitions {
            let mut state: Option<Actor> = None;
            for batch_indexes in partition {
                let batch: Vec<ActorObservation> = batch_indexes
                    .iter()
                    .map(|&i| observations[i].clone())
                    .collect();
                state = merge_actor(state, &batch);
            }
            results.push(state.expect("merged"));
        }

        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
        assert_eq!(results[0].first_seen_at, ts(7, 0));
        assert_eq!(results[0].last_seen_at, ts(14, 0));
    }

    #[test]
    fn bounds_are_monotonic_across_successive_merges() {
        let mut state = merge_actor(None, &[obs(1, ts(10, 0))]);
        let mut first_bound = state.as_ref().unwrap().first_seen_at;
        let mut last_bound = state.as_ref().unwrap().last_seen_at;

        for hour in [12u32, 6, 18, 9, 23] {
            state = merge_actor(state, &[obs(1, ts(hour, 0))]);
            let merged = state.as_ref().unwrap();
            assert!(merged.first_seen_at <= first_bound);
            assert!(merged.last_seen_at >= last_bound);
            first_bound = merged.first_seen_at;
            last_bound = merged.last_seen_at;
        }
        assert_eq!(state.as_ref().unwrap().first_seen_at, ts(6, 0));
        assert_eq!(state.as_ref().unwrap().last_seen_at, ts(23, 0));
    }

    #[test]
    fn event_rows_are_backfilled_but_never_rewritten() {
        let seed = NormalizedEvent {
            event_hash: "abc".to_string(),
            event_id: "1001".to_string(),
            event_type: "PushEvent".to_string(),
            created_at: ts(15, 0),
            actor_id: None,
            repo_id: Some(99),
            org_id: None,
            is_bot: false,
            public: true,
            hour_bucket: "2015-01-01-15".to_string(),
            processed_at: ts(16, 0),
        };
        let incoming = NormalizedEvent {
            actor_id: Some(1),
            repo_id: Some(500),
            processed_at: ts(20, 0),
            ..seed.clone()
        };
        let merged = merge_event(Some(seed.clone()), incoming);
        assert_eq!(merged.actor_id, Some(1));
        assert_eq!(merged.repo_id, Some(99));
        assert_eq!(merged.processed_at, seed.processed_at);
    }

    #[tokio::test]
    async fn engine_applies_one_upsert_per_identity_key() {
        let silver = Arc::new(MemSilverStore::new());
        let engine = MergeEngine::new(silver.clone());

        let mut batches = ObservationBatches::new();
        batches.actors.insert(
            1,
            vec![
                ActorObservation {
                    login: Some("alice".to_string()),
                    ..obs(1, ts(9, 0))
                },
                ActorObservation {
                    actor_type: Some("User".to_string()),
                    ..obs(1, ts(11, 0))
                },
            ],
        );
        batches.actors.insert(2, vec![obs(2, ts(10, 0))]);

        let stats = engine.apply(batches).await.expect("apply");
        assert_eq!(stats.actors, 2);

        let alice = silver.get_actor(1).await.expect("get").expect("present");
        assert_eq!(alice.login.as_deref(), Some("alice"));
        assert_eq!(alice.actor_type.as_deref(), Some("User"));
        assert_eq!(alice.first_seen_at, ts(9, 0));
        assert_eq!(alice.last_seen_at, ts(11, 0));
    }

    #[tokio::test]
    async fn concurrent_same_key_merges_serialize_cleanly() {
        let silver = Arc::new(MemSilverStore::new());
        let engine = Arc::new(MergeEngine::new(silver.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for hour in 6..18u32 {
            let engine = Arc::clone(&engine);
            tasks.spawn(async move {
                let mut batches = ObservationBatches::new();
                batches.actors.insert(
                    1,
                    vec![ActorObservation {
                        login: Some("alice".to_string()),
                        ..obs(1, ts(hour, 0))
                    }],
                );
                engine.apply(batches).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("join").expect("apply");
        }

        let alice = silver.get_actor(1).await.expect("get").expect("present");
        assert_eq!(alice.login.as_deref(), Some("alice"));
        assert_eq!(alice.first_seen_at, ts(6, 0));
        assert_eq!(alice.last_seen_at, ts(17, 0));
    }
}
