//! End-to-end pipeline tests over filesystem-backed stores: idempotent
//! reruns, crash-resume rescans, failed-file surfacing and snapshot export.

use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use gharc_core::FileStatus;
use gharc_storage::{BronzeStore, CheckpointStore, SilverStore};
use gharc_sync::{Pipeline, PipelineConfig};
use sha2::{Digest, Sha256};
use tempfile::tempdir;

fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        raw_dir: root.join("raw"),
        data_dir: root.join("data"),
        reports_dir: root.join("reports"),
        base_url: "https://data.gharchive.org".to_string(),
        max_workers: 2,
        max_retries: 0,
        scheduler_enabled: false,
        ingest_cron: "10 * * * *".to_string(),
        user_agent: "gharc-test/0".to_string(),
        http_timeout_secs: 5,
    }
}

fn write_archive(raw_dir: &Path, file_id: &str, lines: &[serde_json::Value]) {
    fs::create_dir_all(raw_dir).expect("create raw dir");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        encoder
            .write_all(line.to_string().as_bytes())
            .expect("write line");
        encoder.write_all(b"\n").expect("write newline");
    }
    let bytes = encoder.finish().expect("finish gzip");
    fs::write(raw_dir.join(format!("{file_id}.json.gz")), bytes).expect("write archive");
}

fn push_event(
    id: &str,
    created_at: &str,
    actor: serde_json::Value,
    repo: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "type": "PushEvent",
        "created_at": created_at,
        "actor": actor,
        "repo": repo,
        "payload": {"size": 1, "ref": "refs/heads/main"},
    })
}

#[tokio::test]
async fn full_run_is_idempotent_across_reruns() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path());

    let shared = push_event(
        "3000",
        "2015-01-01T15:30:00Z",
        serde_json::json!({"id": 2, "login": "carol"}),
        serde_json::json!({"id": 99, "name": "octo/widgets"}),
    );
    write_archive(
        &config.raw_dir,
        "2015-01-01-15",
        &[
            push_event(
                "1000",
                "2015-01-01T15:00:00Z",
                serde_json::json!({"id": 1, "login": "alice"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            ),
            shared.clone(),
        ],
    );
    write_archive(
        &config.raw_dir,
        "2015-01-01-16",
        &[
            // Same identity fields as an hour-15 record: one bronze row total.
            shared,
            push_event(
                "2000",
                "2015-01-01T09:00:00Z",
                serde_json::json!({"id": 1, "login": "alice", "type": "User"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            ),
        ],
    );

    let pipeline = Pipeline::new(config).await.expect("pipeline");
    let first = pipeline.run_once().await.expect("first run");
    assert_eq!(first.files_discovered, 2);
    assert_eq!(first.files_completed, 2);
    assert_eq!(first.files_failed, 0);
    assert_eq!(first.records_ingested, 3);
    assert_eq!(first.duplicates_skipped, 1);
    assert_eq!(pipeline.bronze().count().await.expect("count"), 3);

    // Attributes observed across files merge coalesce-forward with the
    // earliest observation widening first_seen_at backwards.
    let alice = pipeline
        .silver()
        .get_actor(1)
        .await
        .expect("get")
        .expect("alice present");
    assert_eq!(alice.login.as_deref(), Some("alice"));
    assert_eq!(alice.actor_type.as_deref(), Some("User"));
    assert_eq!(alice.first_seen_at.to_rfc3339(), "2015-01-01T09:00:00+00:00");
    assert_eq!(alice.last_seen_at.to_rfc3339(), "2015-01-01T15:00:00+00:00");

    let repo = pipeline
        .silver()
        .get_repository(99)
        .await
        .expect("get")
        .expect("repo present");
    assert_eq!(repo.owner_login.as_deref(), Some("octo"));
    assert_eq!(repo.short_name.as_deref(), Some("widgets"));

    let silver_events = pipeline.silver().scan_events().await.expect("events");
    assert_eq!(silver_events.len(), 3);
    let facts = pipeline.silver().scan_facts().await.expect("facts");
    assert_eq!(facts.len(), 3);

    // A rerun over unchanged inputs skips both files and changes nothing.
    let second = pipeline.run_once().await.expect("second run");
    assert_eq!(second.files_skipped, 2);
    assert_eq!(second.files_completed, 0);
    assert_eq!(second.records_ingested, 0);
    assert_eq!(pipeline.bronze().count().await.expect("count"), 3);
    assert_eq!(
        pipeline
            .silver()
            .scan_events()
            .await
            .expect("events")
            .len(),
        3
    );
    let alice_after = pipeline
        .silver()
        .get_actor(1)
        .await
        .expect("get")
        .expect("alice present");
    assert_eq!(alice_after, alice);
}

#[tokio::test]
async fn crash_resume_rescans_without_duplicating_bronze_rows() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path());
    write_archive(
        &config.raw_dir,
        "2015-01-01-15",
        &[
            push_event(
                "1000",
                "2015-01-01T15:00:00Z",
                serde_json::json!({"id": 1, "login": "alice"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            ),
            push_event(
                "1001",
                "2015-01-01T15:01:00Z",
                serde_json::json!({"id": 1, "login": "alice"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            ),
        ],
    );

    let pipeline = Pipeline::new(config).await.expect("pipeline");
    let first = pipeline.run_once().await.expect("first run");
    assert_eq!(first.records_ingested, 2);

    // Simulate a crash mid-file: the checkpoint is rolled back to
    // in-progress, so a restart rescans the file from the start.
    pipeline
        .checkpoints()
        .set_status("2015-01-01-15", FileStatus::InProgress)
        .await
        .expect("set status");

    let resumed = pipeline.run_once().await.expect("resumed run");
    assert_eq!(resumed.files_completed, 1);
    assert_eq!(resumed.records_ingested, 0);
    assert_eq!(resumed.duplicates_skipped, 2);
    assert_eq!(pipeline.bronze().count().await.expect("count"), 2);
    assert_eq!(
        pipeline
            .checkpoints()
            .status("2015-01-01-15")
            .await
            .expect("status"),
        FileStatus::Complete
    );
}

#[tokio::test]
async fn corrupt_container_is_marked_failed_and_listed() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path());
    write_archive(
        &config.raw_dir,
        "2015-01-01-15",
        &[push_event(
            "1000",
            "2015-01-01T15:00:00Z",
            serde_json::json!({"id": 1, "login": "alice"}),
            serde_json::json!({"id": 99, "name": "octo/widgets"}),
        )],
    );
    fs::write(
        config.raw_dir.join("2015-01-01-16.json.gz"),
        b"this is not a gzip container",
    )
    .expect("write corrupt file");

    let pipeline = Pipeline::new(config).await.expect("pipeline");
    let summary = pipeline.run_once().await.expect("run");

    assert_eq!(summary.files_completed, 1);
    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.failed_files.len(), 1);
    assert_eq!(summary.failed_files[0].file_id, "2015-01-01-16");
    assert_eq!(
        pipeline
            .checkpoints()
            .status("2015-01-01-16")
            .await
            .expect("status"),
        FileStatus::Failed
    );
    // The healthy file is unaffected by its corrupt sibling.
    assert_eq!(summary.records_ingested, 1);

    // A malformed line inside an otherwise healthy file is a per-line
    // skip, not a file failure.
    let raw_dir = pipeline.config().raw_dir.clone();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"{ broken json\n").expect("write");
    encoder
        .write_all(
            push_event(
                "1700",
                "2015-01-01T17:00:00Z",
                serde_json::json!({"id": 1, "login": "alice"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            )
            .to_string()
            .as_bytes(),
        )
        .expect("write");
    encoder.write_all(b"\n").expect("write");
    fs::write(
        raw_dir.join("2015-01-01-17.json.gz"),
        encoder.finish().expect("finish"),
    )
    .expect("write archive");

    let next = pipeline.run_once().await.expect("next run");
    assert_eq!(next.files_completed, 1);
    assert_eq!(next.records_ingested, 1);
    assert_eq!(next.malformed_lines, 1);
}

#[tokio::test]
async fn snapshot_manifest_checksums_match_exported_files() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path());
    write_archive(
        &config.raw_dir,
        "2015-01-01-15",
        &[push_event(
            "1000",
            "2015-01-01T15:00:00Z",
            serde_json::json!({"id": 1, "login": "alice"}),
            serde_json::json!({"id": 99, "name": "octo/widgets"}),
        )],
    );

    let pipeline = Pipeline::new(config).await.expect("pipeline");
    let summary = pipeline.run_once().await.expect("run");

    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(&summary.parquet_manifest).expect("read manifest"),
    )
    .expect("parse manifest");
    let files = manifest["files"].as_array().expect("files array");
    assert_eq!(files.len(), 5);

    for entry in files {
        let rel = entry["path"].as_str().expect("path");
        let expected_sha = entry["sha256"].as_str().expect("sha256");
        let bytes = fs::read(Path::new(&summary.reports_dir).join(rel)).expect("read parquet");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        assert_eq!(hex::encode(hasher.finalize()), expected_sha);
        assert_eq!(entry["bytes"].as_u64().expect("bytes"), bytes.len() as u64);
    }
}

#[tokio::test]
async fn rebuild_over_current_silver_state_is_a_noop() {
    let dir = tempdir().expect("tempdir");
    let config = test_config(dir.path());
    write_archive(
        &config.raw_dir,
        "2015-01-01-15",
        &[
            push_event(
                "1000",
                "2015-01-01T15:00:00Z",
                serde_json::json!({"id": 1, "login": "alice"}),
                serde_json::json!({"id": 99, "name": "octo/widgets"}),
            ),
            serde_json::json!({
                "id": "1001",
                "type": "IssuesEvent",
                "created_at": "2015-01-01T15:05:00Z",
                "actor": {"id": 2, "login": "renovate[bot]"},
                "repo": {"id": 99, "name": "octo/widgets"},
                "org": {"id": 7, "login": "octo"},
                "payload": {"action": "opened", "issue": {"id": 42}},
            }),
        ],
    );

    let pipeline = Pipeline::new(config).await.expect("pipeline");
    pipeline.run_once().await.expect("run");

    let actors_before = pipeline.silver().scan_actors().await.expect("actors");
    let events_before = pipeline.silver().scan_events().await.expect("events");
    let bot = actors_before
        .iter()
        .find(|a| a.actor_id == 2)
        .expect("bot actor");
    assert_eq!(bot.is_bot, Some(true));
    let org = pipeline
        .silver()
        .get_organization(7)
        .await
        .expect("get")
        .expect("org present");
    assert_eq!(org.login.as_deref(), Some("octo"));

    let rebuild = pipeline.rebuild_silver().await.expect("rebuild");
    assert_eq!(rebuild.records_replayed, 2);
    assert_eq!(rebuild.undecodable_records, 0);

    let actors_after = pipeline.silver().scan_actors().await.expect("actors");
    let events_after = pipeline.silver().scan_events().await.expect("events");
    assert_eq!(actors_before, actors_after);
    assert_eq!(events_before, events_after);

    let issue_fact = pipeline
        .silver()
        .get_fact("1001")
        .await
        .expect("get")
        .expect("fact present");
    assert_eq!(issue_fact.issue_id, Some(42));
    assert_eq!(issue_fact.action.as_deref(), Some("opened"));
}
