//! End-to-end runs over task directories on disk.
//!
//! Every harness here is plain POSIX `sh`, so the tests need nothing beyond
//! a Unix userland.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fixbench::candidate::{parse_selector, BaselineSource, CandidateSource, ReferenceSource};
use fixbench::config::EngineConfig;
use fixbench::patch::PatchRejected;
use fixbench::sandbox::ResourceOutcome;
use fixbench::scheduler::{JobState, RunOrchestrator};
use fixbench::storage::RunArtifactStore;
use fixbench::task::{TaskSelector, TaskStore};
use fixbench::TaskError;
use tempfile::TempDir;

const CHECK_SCRIPT: &str = "#!/bin/sh\nif grep -q '^enabled=1$' settings.conf; then\n  echo '1 passed'\nelse\n  echo 'settings.conf still disabled'\n  echo '1 failed'\nfi\n";

const REFERENCE: &str = "--- a/settings.conf\n+++ b/settings.conf\n@@ -1,2 +1,2 @@\n name=demo\n-enabled=0\n+enabled=1\n";

fn write_task(root: &Path, id: &str, harness_yaml: &str) {
    let dir = root.join(id);
    fs::create_dir_all(dir.join("source")).expect("source dir");
    fs::create_dir_all(dir.join("harness")).expect("harness dir");
    fs::write(
        dir.join("task.yaml"),
        format!("id: {id}\ncategory: config\nengine: toy\ntier: 1\nharness:\n{harness_yaml}"),
    )
    .expect("task.yaml");
    fs::write(dir.join("prompt.md"), "Enable the setting.\n").expect("prompt");
    fs::write(dir.join("source/settings.conf"), "name=demo\nenabled=0\n").expect("source");
    fs::write(dir.join("harness/check.sh"), CHECK_SCRIPT).expect("harness");
    fs::write(dir.join("reference.patch"), REFERENCE).expect("reference");
}

fn scripted(command: &str, timeout_secs: u64) -> String {
    format!(
        "  strategy: scripted_test_runner\n  command: \"{command}\"\n  timeout_secs: {timeout_secs}\n"
    )
}

fn config() -> EngineConfig {
    EngineConfig::default().with_workers(2).with_max_retries(1)
}

fn reference_and_baseline() -> Vec<Arc<dyn CandidateSource>> {
    vec![Arc::new(ReferenceSource), Arc::new(BaselineSource)]
}

#[tokio::test]
async fn test_directory_candidates_are_recorded_with_provenance() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    write_task(tasks.path(), "cfg-002", &scripted("sh check.sh", 20));

    let candidates = TempDir::new().expect("tempdir");
    fs::write(candidates.path().join("cfg-001.patch"), REFERENCE).expect("patch");
    fs::write(
        candidates.path().join("provenance.json"),
        r#"{"model": "toy-model", "timestamp": "2026-01-02T03:04:05Z"}"#,
    )
    .expect("provenance");

    let store = TaskStore::open(tasks.path()).expect("store");
    let loaded = store.load_selected(&TaskSelector::all()).expect("load");
    assert_eq!(loaded.len(), 2);

    let selector = format!("dir:{}@toy", candidates.path().display());
    let source = parse_selector(&selector).expect("selector");
    let output = TempDir::new().expect("tempdir");
    let summary = RunOrchestrator::new(config(), output.path())
        .with_run_id("dir-run")
        .run(loaded, &[source])
        .await
        .expect("run");

    assert!(summary.all_evaluated());
    let first = summary
        .records
        .iter()
        .find(|r| r.task.id == "cfg-001")
        .expect("cfg-001 record");
    assert_eq!(first.state, JobState::Succeeded);
    assert_eq!(first.candidate.source, "toy");
    assert_eq!(first.candidate.model.as_deref(), Some("toy-model"));
    let patch = first.patch.as_ref().expect("patch summary");
    assert_eq!(patch.files, vec!["settings.conf".to_string()]);
    assert_eq!((patch.lines_added, patch.lines_removed), (1, 1));

    let second = summary
        .records
        .iter()
        .find(|r| r.task.id == "cfg-002")
        .expect("cfg-002 record");
    assert_eq!(second.state, JobState::Failed);
    assert_eq!(second.rejection, Some(PatchRejected::NoCandidate));

    let reopened = RunArtifactStore::open(output.path(), "dir-run").expect("open");
    let persisted = reopened.read_record(&first.record_id).await.expect("read");
    assert_eq!(persisted.score, first.score);
    assert_eq!(reopened.list_records().await.expect("list").len(), 2);
    assert!(output.path().join("dir-run/manifest.json").is_file());
}

#[tokio::test]
async fn test_timeout_is_scored_not_retried() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "slow-001", &scripted("sleep 30; echo '1 passed'", 1));
    let loaded = TaskStore::open(tasks.path())
        .expect("store")
        .load_selected(&TaskSelector::all())
        .expect("load");

    let output = TempDir::new().expect("tempdir");
    let reference: Vec<Arc<dyn CandidateSource>> = vec![Arc::new(ReferenceSource)];
    let started = std::time::Instant::now();
    let summary = RunOrchestrator::new(config(), output.path())
        .run(loaded, &reference)
        .await
        .expect("run");
    assert!(started.elapsed() < Duration::from_secs(20));

    let record = &summary.records[0];
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.executions.len(), 1);
    assert_eq!(record.executions[0].outcome, ResourceOutcome::TimedOut);
    assert!(!record.score.pass);
}

#[tokio::test]
async fn test_out_of_range_hunk_rejected_without_execution() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    let lines: String = (1..=30).map(|i| format!("line {i}\n")).collect();
    fs::write(tasks.path().join("cfg-001/source/long.txt"), lines).expect("long");

    let candidates = TempDir::new().expect("tempdir");
    fs::write(
        candidates.path().join("cfg-001.diff"),
        "--- a/long.txt\n+++ b/long.txt\n@@ -50,1 +50,1 @@\n-line 50\n+line fifty\n",
    )
    .expect("diff");

    let loaded = TaskStore::open(tasks.path())
        .expect("store")
        .load_selected(&TaskSelector::all())
        .expect("load");
    let source = parse_selector(&format!("dir:{}", candidates.path().display())).expect("selector");
    let output = TempDir::new().expect("tempdir");
    let summary = RunOrchestrator::new(config(), output.path())
        .run(loaded, &[source])
        .await
        .expect("run");

    let record = &summary.records[0];
    assert_eq!(record.state, JobState::Failed);
    assert!(matches!(record.rejection, Some(PatchRejected::ContextMismatch { .. })));
    assert!(record.executions.is_empty());
    assert_eq!(record.score.value, 0.0);
    assert_eq!(summary.manifest.totals.rejected, 1);
}

#[tokio::test]
async fn test_file_over_existing_directory_is_a_rejection_not_an_infrastructure_error() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    fs::create_dir_all(tasks.path().join("cfg-001/source/conf.d")).expect("conf.d");
    fs::write(tasks.path().join("cfg-001/source/conf.d/extra.conf"), "x=1\n").expect("extra");

    let candidates = TempDir::new().expect("tempdir");
    fs::write(
        candidates.path().join("cfg-001.diff"),
        "--- /dev/null\n+++ b/conf.d\n@@ -0,0 +1 @@\n+oops\n",
    )
    .expect("diff");

    let loaded = TaskStore::open(tasks.path())
        .expect("store")
        .load_selected(&TaskSelector::all())
        .expect("load");
    let source = parse_selector(&format!("dir:{}", candidates.path().display())).expect("selector");
    let output = TempDir::new().expect("tempdir");
    let summary = RunOrchestrator::new(config(), output.path())
        .run(loaded, &[source])
        .await
        .expect("run");

    let record = &summary.records[0];
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);
    assert!(matches!(record.rejection, Some(PatchRejected::PolicyViolation { .. })));
    assert!(record.infrastructure_errors.is_empty());
}

#[tokio::test]
async fn test_background_processes_do_not_survive_the_job() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(
        tasks.path(),
        "bg-001",
        &scripted("sleep 317 >/dev/null 2>&1 & echo '1 passed'", 20),
    );
    let loaded = TaskStore::open(tasks.path())
        .expect("store")
        .load_selected(&TaskSelector::all())
        .expect("load");

    let output = TempDir::new().expect("tempdir");
    let reference: Vec<Arc<dyn CandidateSource>> = vec![Arc::new(ReferenceSource)];
    let summary = RunOrchestrator::new(config(), output.path())
        .run(loaded, &reference)
        .await
        .expect("run");
    assert_eq!(summary.records[0].state, JobState::Succeeded);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let survivors = fs::read_dir("/proc")
        .expect("proc")
        .flatten()
        .filter_map(|entry| fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| {
            let text = String::from_utf8_lossy(cmdline).replace('\0', " ");
            text.trim() == "sleep 317"
        })
        .count();
    assert_eq!(survivors, 0);
}

#[tokio::test]
async fn test_same_inputs_give_same_scores() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    let store = TaskStore::open(tasks.path()).expect("store");
    let output = TempDir::new().expect("tempdir");

    let mut scores = Vec::new();
    for run_id in ["first", "second"] {
        let loaded = store.load_selected(&TaskSelector::all()).expect("load");
        let summary = RunOrchestrator::new(config(), output.path())
            .with_run_id(run_id)
            .run(loaded, &reference_and_baseline())
            .await
            .expect("run");
        let mut run_scores: Vec<_> = summary
            .records
            .iter()
            .map(|r| (r.candidate.source.clone(), r.score))
            .collect();
        run_scores.sort_by(|a, b| a.0.cmp(&b.0));
        scores.push(run_scores);
    }
    assert_eq!(scores[0], scores[1]);
}

#[test]
fn test_malformed_task_fails_loading() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    write_task(
        tasks.path(),
        "cfg-002",
        "  strategy: scripted_test_runner\n  command: sh check.sh\n  summary_pattern: \"(unclosed\"\n",
    );

    let err = TaskStore::open(tasks.path())
        .expect("store")
        .load_selected(&TaskSelector::all())
        .expect_err("malformed task must fail");
    assert!(matches!(err, TaskError::Malformed { .. }), "{err:?}");
}

#[test]
fn test_selector_filters_tasks() {
    let tasks = TempDir::new().expect("tempdir");
    write_task(tasks.path(), "cfg-001", &scripted("sh check.sh", 20));
    write_task(tasks.path(), "cfg-002", &scripted("sh check.sh", 20));

    let store = TaskStore::open(tasks.path()).expect("store");
    let only = store
        .load_selected(&TaskSelector::all().with_task("cfg-002"))
        .expect("load");
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].id, "cfg-002");

    let none = store
        .load_selected(&TaskSelector::all().with_engine("quake"))
        .expect("load");
    assert!(none.is_empty());
}
