use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn relay_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_relay"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Source tree to index
    let src = root.join("project").join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(
        src.join("lib.rs"),
        "//! Payment service crate root.\npub mod billing;\npub mod ledger;\npub fn start() {}\n",
    )
    .unwrap();
    fs::write(
        src.join("billing.rs"),
        "//! Invoice generation and billing runs.\nuse crate::ledger;\npub struct Invoice;\npub fn bill() {}\n",
    )
    .unwrap();
    fs::write(
        src.join("ledger.rs"),
        "//! Double-entry ledger.\npub struct Ledger;\npub fn post() {}\n",
    )
    .unwrap();

    let config_content = r#"[cache]
path = "../data/index-cache.json"
source_root = "../project"

[router]
backoff_base_ms = 1
log_path = "../data/delegation.jsonl"

[[models]]
name = "local"
provider = "echo"
max_context_tokens = 8000
cost_class = "low"
strengths = ["rust"]

[[models]]
name = "backup"
provider = "echo"
max_context_tokens = 8000
cost_class = "high"
"#;

    let config_path = config_dir.join("relay.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_relay(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = relay_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run relay binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_index_builds_then_reuses() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_relay(&config_path, &["index"]);
    assert!(success, "index failed: {}", stderr);
    assert!(stdout.starts_with("built: 3 modules"), "stdout: {}", stdout);

    let (stdout, _, success) = run_relay(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.starts_with("up to date: 3 modules"), "stdout: {}", stdout);

    let (stdout, _, success) = run_relay(&config_path, &["index", "--force"]);
    assert!(success);
    assert!(stdout.starts_with("rebuilt: 3 modules"), "stdout: {}", stdout);
}

#[test]
fn test_status_reports_freshness() {
    let (tmp, config_path) = setup_test_env();
    run_relay(&config_path, &["index"]);

    let (stdout, _, success) = run_relay(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("(fresh)"), "stdout: {}", stdout);
    assert!(stdout.contains("Modules:      3"));

    fs::write(
        tmp.path().join("project/src/ledger.rs"),
        "//! Ledger.\npub fn post() {}\npub fn reverse() {}\n",
    )
    .unwrap();
    let (stdout, _, success) = run_relay(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("(stale)"), "stdout: {}", stdout);
}

#[test]
fn test_search_finds_module() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_relay(&config_path, &["search", "invoice"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("src/billing.rs"), "stdout: {}", stdout);
    assert!(!stdout.contains("src/ledger.rs"));

    let (stdout, _, success) = run_relay(&config_path, &["search", "kubernetes"]);
    assert!(success);
    assert!(stdout.contains("No modules match"));
}

#[test]
fn test_context_prints_package_and_summary() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_relay(
        &config_path,
        &["context", "--scenario", "minimal", "--query", "billing"],
    );
    assert!(success, "context failed: {}", stderr);
    assert!(stdout.starts_with("## src/billing.rs"), "stdout: {}", stdout);
    assert!(stderr.contains("minimal: 3 fragments"), "stderr: {}", stderr);
    assert!(stderr.contains("rejected (0 tokens)"), "stderr: {}", stderr);
}

#[test]
fn test_context_json_is_parseable() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_relay(&config_path, &["context", "--json"]);
    assert!(success);
    let package: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(package["scenario"], "focused");
    assert!(package["total_tokens_used"].as_u64().unwrap() <= 32_000);
}

#[test]
fn test_unknown_scenario_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_relay(&config_path, &["context", "--scenario", "galaxy"]);
    assert!(!success);
    assert!(stderr.contains("galaxy"));
}

#[test]
fn test_delegate_dry_run_calls_nothing() {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_relay(
        &config_path,
        &["delegate", "summarise billing", "--query", "billing", "--dry-run"],
    );
    assert!(success, "delegate failed: {}", stderr);
    assert!(stdout.contains("Selected: local"), "stdout: {}", stdout);
    let log = tmp.path().join("data/delegation.jsonl");
    let logged = fs::read_to_string(&log).unwrap_or_default();
    assert!(logged.trim().is_empty());
}

#[test]
fn test_delegate_runs_and_logs() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_relay(
        &config_path,
        &["delegate", "summarise billing", "--model", "backup"],
    );
    assert!(success, "delegate failed: {}", stderr);
    assert!(stdout.starts_with("[backup] part 1 of 1"), "stdout: {}", stdout);

    let (stdout, _, success) = run_relay(&config_path, &["log", "stats"]);
    assert!(success);
    assert!(stdout.contains("backup"), "stdout: {}", stdout);
    assert!(stdout.contains("Attempts:    1"));
}

#[test]
fn test_delegate_unknown_model_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_relay(&config_path, &["delegate", "x", "--model", "ghost"]);
    assert!(!success);
    assert!(stderr.contains("ghost"));
}

#[test]
fn test_batch_runs_every_task() {
    let (tmp, config_path) = setup_test_env();
    let batch = tmp.path().join("tasks.toml");
    fs::write(
        &batch,
        r#"[[tasks]]
description = "document the ledger"
query = "ledger"
tags = ["rust"]

[[tasks]]
description = "review billing"
scenario = "minimal"
query = "billing"
"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_relay(
        &config_path,
        &["batch", batch.to_str().unwrap(), "--dry-run", "--progress", "off"],
    );
    assert!(success, "batch dry run failed: {}", stderr);
    assert!(stdout.contains("Dry run: 2 task(s)"), "stdout: {}", stdout);

    let (stdout, stderr, success) = run_relay(
        &config_path,
        &[
            "batch",
            batch.to_str().unwrap(),
            "--concurrency",
            "2",
            "--progress",
            "off",
            "--json",
        ],
    );
    assert!(success, "batch failed: {}", stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let tasks = report["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t["status"] == "succeeded"));
}

#[test]
fn test_models_lists_cheapest_first() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_relay(&config_path, &["models"]);
    assert!(success);
    let local = stdout.find("local").unwrap();
    let backup = stdout.find("backup").unwrap();
    assert!(local < backup);
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, config_path) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace("provider = \"echo\"\nmax_context_tokens = 8000\ncost_class = \"high\"", "provider = \"carrier-pigeon\"\nmax_context_tokens = 8000\ncost_class = \"high\"");
    fs::write(&bad, content).unwrap();

    let (_, stderr, success) = run_relay(&bad, &["status"]);
    assert!(!success);
    assert!(stderr.contains("carrier-pigeon"), "stderr: {}", stderr);
}
