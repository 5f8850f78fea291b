use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use tempfile::TempDir;

fn integrator_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("integrator");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let catalog = root.join("catalog");
    fs::create_dir_all(&catalog).unwrap();
    fs::write(
        catalog.join("books.json"),
        r#"[
  {"id": "dune", "title": "Dune", "authors": ["Frank Herbert"], "isbn": "0-441-01359-7", "published": "1965"},
  {"id": "neuromancer", "title": "Neuromancer", "authors": "Gibson, William", "isbn": "9780441569595"}
]"#,
    )
    .unwrap();
    fs::write(
        catalog.join("more.jsonl"),
        "{\"id\": \"d-1\", \"title\": \"dune\", \"author\": \"Frank Herbert\", \"publisher\": \"Chilton Books\"}\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/articles.sqlite"

[pipeline]
incremental = true

[retry]
max_attempts = 1
initial_backoff_ms = 1
max_backoff_ms = 1

[sources.filesystem.catalog]
root = "{root}/catalog"

[sources.staging.inbox]
status = "processed"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("integrator.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_integrator(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = integrator_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run integrator binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// `run --json`, parsed.
fn run_json(config_path: &Path, extra: &[&str]) -> Value {
    let mut args = vec!["run", "--json", "--progress", "off"];
    args.extend_from_slice(extra);
    let (stdout, stderr, success) = run_integrator(config_path, &args);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("run output is not JSON ({}): {}", e, stdout))
}

fn envelope_file(dir: &Path, doc_id: &str) -> PathBuf {
    let path = dir.join(format!("{}.envelope.json", doc_id));
    let body = serde_json::json!({ "message": { "data": STANDARD.encode(doc_id) } });
    fs::write(&path, body.to_string()).unwrap();
    path
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_integrator(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_integrator(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_integrator(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_configured_adapters() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let (stdout, _, success) = run_integrator(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("filesystem:catalog"));
    assert!(stdout.contains("staging:inbox"));
}

#[test]
fn test_run_merges_matching_records() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let result = run_json(&config_path, &[]);

    assert_eq!(result["final_stage"], "completed");
    assert_eq!(result["record_count"], 3);
    assert_eq!(result["group_count"], 2);
    assert_eq!(result["written_count"], 2);
    assert_eq!(result["failed_sources"].as_array().unwrap().len(), 0);
}

#[test]
fn test_run_incremental_and_idempotent() {
    let (tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    run_json(&config_path, &[]);

    // Nothing changed on disk: nothing fetched, nothing written.
    let second = run_json(&config_path, &[]);
    assert_eq!(second["sources"][0]["fetched"], 0);
    assert_eq!(second["record_count"], 3);
    assert_eq!(second["written_count"], 0);
    assert_eq!(second["unchanged_count"], 2);

    // --full refetches everything but still writes nothing new.
    let full = run_json(&config_path, &["--full"]);
    assert_eq!(full["sources"][0]["fetched"], 3);
    assert_eq!(full["written_count"], 0);

    // Modify one file (need to ensure mtime actually changes)
    std::thread::sleep(std::time::Duration::from_millis(1100));
    fs::write(
        tmp.path().join("catalog").join("more.jsonl"),
        "{\"id\": \"d-1\", \"title\": \"dune\", \"author\": \"Frank Herbert\", \"summary\": \"Desert planet.\"}\n",
    )
    .unwrap();

    let third = run_json(&config_path, &[]);
    assert_eq!(third["sources"][0]["fetched"], 1);
    assert_eq!(third["written_count"], 1);
}

#[test]
fn test_run_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let result = run_json(&config_path, &["--dry-run"]);
    assert_eq!(result["dry_run"], true);
    assert_eq!(result["written_count"], 2);

    let (_, _, found) = run_integrator(&config_path, &["lookup", "isbn", "9780441013593"]);
    assert!(!found, "dry run must not persist articles");
}

#[test]
fn test_run_selects_sources() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let result = run_json(&config_path, &["--source", "staging"]);
    assert_eq!(result["sources"].as_array().unwrap().len(), 1);
    assert_eq!(result["sources"][0]["source_id"], "staging:inbox");
    assert_eq!(result["group_count"], 0);

    let (_, stderr, success) =
        run_integrator(&config_path, &["run", "--source", "http:nope", "--progress", "off"]);
    assert!(!success);
    assert!(stderr.contains("http:nope"), "stderr: {}", stderr);
}

#[test]
fn test_lookup_and_show() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    run_json(&config_path, &[]);

    // ISBN-10 input finds the ISBN-13 the article carries.
    let (stdout, stderr, success) =
        run_integrator(&config_path, &["lookup", "ISBN", "0-441-01359-7", "--json"]);
    assert!(success, "lookup failed: {}", stderr);
    let article: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(article["fields"]["identifier.isbn"], "9780441013593");
    assert_eq!(article["fields"]["publisher"], "Chilton Books");
    assert_eq!(article["members"].as_array().unwrap().len(), 2);

    let id = article["canonical_id"].as_str().unwrap();
    let (stdout, _, success) = run_integrator(&config_path, &["show", id]);
    assert!(success);
    assert!(stdout.contains(id));
    assert!(stdout.contains("--- Fields ---"));
    assert!(stdout.contains("filesystem:catalog"));

    let (_, _, success) = run_integrator(&config_path, &["show", "art_missing"]);
    assert!(!success);
}

#[test]
fn test_stage_and_push_promotes_document() {
    let (tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let doc = tmp.path().join("doc.json");
    fs::write(
        &doc,
        r#"{"title": "Hyperion", "authors": ["Dan Simmons"], "isbn": "9780553283686", "status": "processed"}"#,
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_integrator(&config_path, &["stage", "doc-1", doc.to_str().unwrap()]);
    assert!(success, "stage failed: {}", stderr);
    assert!(stdout.contains("staged doc-1"));

    let envelope = envelope_file(tmp.path(), "doc-1");
    let (stdout, stderr, success) = run_integrator(
        &config_path,
        &["push", "--envelope", envelope.to_str().unwrap()],
    );
    assert!(success, "push failed: {}", stderr);
    assert!(stdout.contains("promoted doc-1 -> art_"), "stdout: {}", stdout);

    let (_, _, found) = run_integrator(&config_path, &["lookup", "isbn", "9780553283686"]);
    assert!(found);

    // Promotion consumed the staged row.
    let (stdout, _, success) = run_integrator(
        &config_path,
        &["push", "--envelope", envelope.to_str().unwrap()],
    );
    assert!(success);
    assert!(stdout.contains("not found"), "stdout: {}", stdout);
}

#[test]
fn test_run_drains_staging_every_time() {
    let (tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let doc = tmp.path().join("doc.json");
    fs::write(&doc, r#"{"title": "Hyperion", "isbn": "9780553283686"}"#).unwrap();
    run_integrator(&config_path, &["stage", "z-1", doc.to_str().unwrap()]);

    let first = run_json(&config_path, &["--source", "staging"]);
    assert_eq!(first["written_count"], 1);
    assert_eq!(first["sources"][0]["acknowledged"], 1);

    // Staged after the first run, and sorting before its last id.
    fs::write(&doc, r#"{"title": "Ilium", "isbn": "9780380817924"}"#).unwrap();
    run_integrator(&config_path, &["stage", "a-1", doc.to_str().unwrap()]);

    let second = run_json(&config_path, &["--source", "staging"]);
    assert_eq!(second["sources"][0]["fetched"], 1);
    assert_eq!(second["written_count"], 1);
}

#[test]
fn test_push_ignores_unprocessed_document() {
    let (tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let doc = tmp.path().join("doc.json");
    fs::write(&doc, r#"{"title": "Hyperion"}"#).unwrap();
    run_integrator(
        &config_path,
        &["stage", "doc-2", doc.to_str().unwrap(), "--status", "pending"],
    );

    let envelope = envelope_file(tmp.path(), "doc-2");
    let (stdout, _, success) = run_integrator(
        &config_path,
        &["push", "--envelope", envelope.to_str().unwrap()],
    );
    assert!(success);
    assert!(stdout.contains("status 'pending'"), "stdout: {}", stdout);
}

#[test]
fn test_push_rejects_bad_envelope() {
    let (tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    let bad = tmp.path().join("bad.json");
    fs::write(&bad, r#"{"message": {}}"#).unwrap();
    let (_, stderr, success) =
        run_integrator(&config_path, &["push", "--envelope", bad.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("message.data"), "stderr: {}", stderr);
}

#[test]
fn test_stats() {
    let (_tmp, config_path) = setup_test_env();

    run_integrator(&config_path, &["init"]);
    run_json(&config_path, &[]);

    let (stdout, stderr, success) = run_integrator(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("2 live, 0 superseded"), "stdout: {}", stdout);
    assert!(stdout.contains("Records:     3"));
    assert!(stdout.contains("filesystem:catalog"));
    assert!(stdout.contains("Recent runs"));
}
