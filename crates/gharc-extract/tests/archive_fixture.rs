//! Decode an on-disk fixture archive and run the extractors end-to-end.

use std::fs;
use std::io::Write;

use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use gharc_extract::{ArchiveDecoder, RawEvent};
use tempfile::tempdir;

#[test]
fn fixture_archive_yields_records_and_observations() {
    let lines = [
        serde_json::json!({
            "id": "2489651045",
            "type": "PushEvent",
            "created_at": "2015-01-01T15:00:01Z",
            "actor": {
                "id": 665991,
                "login": "alice",
                "display_login": "alice",
                "url": "https://api.github.com/users/alice",
                "avatar_url": "https://avatars.githubusercontent.com/u/665991",
                "gravatar_id": "",
            },
            "repo": {
                "id": 28688495,
                "name": "octo/widgets",
                "url": "https://api.github.com/repos/octo/widgets",
            },
            "org": {"id": 9919, "login": "octo"},
            "payload": {
                "size": 4,
                "distinct_size": 3,
                "ref": "refs/heads/main",
                "head": "a9f2cc...",
                "before": "4f1e88...",
            },
            "public": true,
        })
        .to_string(),
        "garbage line".to_string(),
        serde_json::json!({
            "id": "2489651099",
            "type": "IssuesEvent",
            "created_at": "2015-01-01T15:00:09Z",
            "actor": {"id": 7194491, "login": "renovate[bot]"},
            "repo": {"id": 28688495, "name": "octo/widgets"},
            "payload": {"action": "opened", "issue": {"id": 53222517}},
        })
        .to_string(),
    ];

    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("2015-01-01-15.json.gz");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in &lines {
        encoder.write_all(line.as_bytes()).expect("write line");
        encoder.write_all(b"\n").expect("write newline");
    }
    fs::write(&path, encoder.finish().expect("finish gzip")).expect("write archive");

    let mut decoder = ArchiveDecoder::open(&path).expect("open archive");
    let mut decoded = Vec::new();
    for item in &mut decoder {
        decoded.push(item.expect("decoded event"));
    }
    assert_eq!(decoder.decoded(), 2);
    assert_eq!(decoder.skipped(), 1);

    let push = &decoded[0];
    let actor = push.event.actor_observation().expect("actor");
    assert_eq!(actor.actor_id, 665991);
    assert_eq!(actor.is_bot, Some(false));
    let repo = push.event.repo_observation().expect("repo");
    assert_eq!(repo.owner_login.as_deref(), Some("octo"));
    let org = push.event.org_observation().expect("org");
    assert_eq!(org.login.as_deref(), Some("octo"));
    let fact = push.event.payload_fact();
    assert_eq!(fact.push_size, Some(4));
    assert_eq!(fact.ref_name.as_deref(), Some("refs/heads/main"));

    let issue = &decoded[1];
    let actor = issue.event.actor_observation().expect("actor");
    assert_eq!(actor.is_bot, Some(true));
    assert_eq!(issue.event.payload_fact().issue_id, Some(53222517));

    // The bronze record retains the full document: replaying it through
    // the typed model yields the same observations.
    let ingested_at = Utc.with_ymd_and_hms(2015, 1, 2, 0, 0, 0).single().unwrap();
    let record = push.to_raw_record("2015-01-01-15", ingested_at);
    assert_eq!(record.fingerprint, push.fingerprint());
    assert_eq!(record.event_type, "PushEvent");
    let replayed: RawEvent =
        serde_json::from_value(record.raw_payload.clone()).expect("replay bronze record");
    assert_eq!(
        replayed.actor_observation().expect("actor"),
        push.event.actor_observation().expect("actor")
    );
    assert_eq!(
        replayed.normalized_event(&record.fingerprint, ingested_at),
        push.event.normalized_event(&record.fingerprint, ingested_at)
    );
}
