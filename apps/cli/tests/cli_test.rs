//! Integration tests for the `stratus` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

const PIPELINE: &str = r#"
name = "pipeline"

[[steps]]
step_id = "fetch"
target = "fetcher"
payload = { url = "https://example.com" }
output_variable = "page"

[[steps]]
step_id = "summarize"
target = "summarizer"
depends_on = ["fetch"]

[[steps]]
step_id = "review"
coordination_group_id = "panel"
depends_on = ["summarize"]
payload = { vote = "approve" }

[[groups]]
group_id = "panel"
targets = ["alice", "bob", "carol"]
strategy = { type = "consensus", rule = "majority" }
"#;

const FAILING: &str = r#"
name = "failing"

[[steps]]
step_id = "broken"
target = "worker"
payload = { fail = "bad input" }

[[steps]]
step_id = "after"
target = "worker"
depends_on = ["broken"]
"#;

const CYCLIC: &str = r#"
name = "cyclic"

[[steps]]
step_id = "a"
target = "x"
depends_on = ["b"]

[[steps]]
step_id = "b"
target = "x"
depends_on = ["a"]
"#;

/// Temp workspace with an empty config so no user config leaks in.
fn workspace(definitions: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("stratus.toml"), "").unwrap();
    for (name, content) in definitions {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

fn stratus(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stratus").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("STRATUS_CONFIG")
        .env("RUST_LOG", "off")
        .arg("--config")
        .arg(dir.path().join("stratus.toml"));
    cmd
}

fn run_json(dir: &TempDir, file: &str, extra: &[&str]) -> (bool, Value) {
    let output = stratus(dir).arg("run").arg(file).arg("--json").args(extra).output().unwrap();
    let run = serde_json::from_slice(&output.stdout).unwrap();
    (output.status.success(), run)
}

#[test]
fn test_validate_reports_levels() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    stratus(&dir)
        .arg("validate")
        .arg("pipeline.toml")
        .assert()
        .success()
        .stdout(predicate::str::contains("'pipeline' is valid"))
        .stdout(predicate::str::contains("fetch"));
}

#[test]
fn test_validate_json() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    let output = stratus(&dir).arg("validate").arg("pipeline.toml").arg("--json").output().unwrap();
    assert!(output.status.success());

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], true);
    assert_eq!(report["steps"], 3);
    assert_eq!(report["levels"], serde_json::json!([["fetch"], ["summarize"], ["review"]]));
}

#[test]
fn test_validate_rejects_cycle() {
    let dir = workspace(&[("cyclic.toml", CYCLIC)]);
    stratus(&dir)
        .arg("validate")
        .arg("cyclic.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("circular dependency"));
}

#[test]
fn test_validate_missing_file() {
    let dir = workspace(&[]);
    stratus(&dir)
        .arg("validate")
        .arg("nope.toml")
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.toml"));
}

#[test]
fn test_run_completes_and_status_replays_it() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    let (ok, run) = run_json(&dir, "pipeline.toml", &["--var", "lang=\"en\"", "--var", "limit=3"]);

    assert!(ok);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["variables"]["lang"], "en");
    assert_eq!(run["variables"]["limit"], 3);
    assert_eq!(run["variables"]["page"]["url"], "https://example.com");
    assert_eq!(run["step_results"]["review"]["output"]["decision"], "approve");

    let run_id = run["run_id"].as_str().unwrap();
    let output = stratus(&dir).arg("status").arg(run_id).arg("--json").output().unwrap();
    assert!(output.status.success());
    let replayed: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(replayed["status"], "completed");
    assert_eq!(replayed["completed_steps"].as_array().unwrap().len(), 3);

    stratus(&dir)
        .arg("status")
        .arg(run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("summarize"));
}

#[test]
fn test_failed_run_exits_non_zero() {
    let dir = workspace(&[("failing.toml", FAILING)]);
    let (ok, run) = run_json(&dir, "failing.toml", &[]);

    assert!(!ok);
    assert_eq!(run["status"], "failed");
    assert_eq!(run["step_results"]["broken"]["status"], "failed");
    assert_eq!(run["step_results"]["broken"]["classification"], "logic");
    assert!(run["step_results"].get("after").is_none());
}

#[test]
fn test_run_rejects_bad_variable() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    stratus(&dir)
        .arg("run")
        .arg("pipeline.toml")
        .arg("--var")
        .arg("novalue")
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn test_runs_lists_and_purge_removes() {
    let dir = workspace(&[("pipeline.toml", PIPELINE), ("failing.toml", FAILING)]);
    stratus(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found"));

    let (_, first) = run_json(&dir, "pipeline.toml", &[]);
    run_json(&dir, "failing.toml", &[]);

    let output = stratus(&dir).arg("runs").arg("--json").output().unwrap();
    let runs: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 2);

    let run_id = first["run_id"].as_str().unwrap();
    stratus(&dir)
        .arg("purge")
        .arg(run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged"));
    stratus(&dir).arg("status").arg(run_id).assert().failure().stderr(predicate::str::contains("not found"));
}

#[test]
fn test_resume_finished_run_fails() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    let (_, run) = run_json(&dir, "pipeline.toml", &[]);

    stratus(&dir)
        .arg("resume")
        .arg(run["run_id"].as_str().unwrap())
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be resumed"));
}

#[test]
fn test_custom_store_directory() {
    let dir = workspace(&[("pipeline.toml", PIPELINE)]);
    let (ok, _) = run_json(&dir, "pipeline.toml", &["--store", "state"]);
    assert!(ok);
    assert!(dir.path().join("state").join("runs").is_dir());
    assert!(!dir.path().join(".stratus").exists());
}
