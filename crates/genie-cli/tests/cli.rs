use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

fn genie(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_genie"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("GENIE_HOME")
        .env_remove("GENIE_LOG")
        .output()
        .expect("run genie")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn tasks_file(root: &Path) -> PathBuf {
    root.join(".genie").join("state").join("tasks.json")
}

fn write_store(path: &Path, value: &Value) {
    fs::create_dir_all(path.parent().expect("parent")).expect("state dir");
    fs::write(path, serde_json::to_string_pretty(value).expect("serialize")).expect("write store");
}

fn v3_store() -> Value {
    json!({
        "version": 3,
        "sessions": {
            "genie-1": {
                "agent": "implementor",
                "sessionId": "attempt-9",
                "status": "running",
                "executor": "CODEX",
                "lastUsed": "2026-01-02T10:00:00.000Z"
            }
        }
    })
}

#[test]
fn list_migrates_legacy_store_and_reconciles_status() {
    let temp = TempDir::new().expect("tempdir");
    write_store(&tasks_file(temp.path()), &v3_store());

    let output = genie(temp.path(), &["list", "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("warning: Migrated 1 task(s) from v3 to v4."));

    let listed: Value = serde_json::from_str(&stdout(&output)).expect("json output");
    let entries = listed.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], json!("attempt-9"));
    assert_eq!(entries[0]["displayStatus"], json!("stopped"));
    assert_eq!(entries[0]["status"], json!("running"));
    assert_eq!(entries[0]["executor"], json!("CODEX"));
}

#[test]
fn list_on_empty_workspace_says_so() {
    let temp = TempDir::new().expect("tempdir");
    let output = genie(temp.path(), &["list"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output).trim(), "No tasks found.");
}

#[test]
fn show_unknown_id_fails() {
    let temp = TempDir::new().expect("tempdir");
    write_store(&tasks_file(temp.path()), &v3_store());

    let output = genie(temp.path(), &["show", "nope"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Session not found: nope"));
}

#[test]
fn migrate_dry_run_leaves_file_untouched() {
    let temp = TempDir::new().expect("tempdir");
    let path = tasks_file(temp.path());
    write_store(&path, &v3_store());
    let before = fs::read_to_string(&path).expect("read");

    let output = genie(temp.path(), &["migrate", "--dry-run"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("dry run"));
    assert_eq!(fs::read_to_string(&path).expect("read"), before);

    let output = genie(temp.path(), &["migrate"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let written: Value =
        serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
    assert_eq!(written["version"], json!(4));
    assert!(written["sessions"].get("attempt-9").is_some());
    assert!(written["sessions"]["attempt-9"].get("sessionId").is_none());

    let output = genie(temp.path(), &["list"]);
    assert!(!stderr(&output).contains("Migrated"));
}

#[test]
fn migrate_without_store_reports_nothing_to_do() {
    let temp = TempDir::new().expect("tempdir");
    let output = genie(temp.path(), &["migrate"]);
    assert!(output.status.success());
    assert_eq!(stdout(&output).trim(), "No tasks store found.");
    assert!(!tasks_file(temp.path()).exists());
}

#[test]
fn mark_updates_status_and_exit_code() {
    let temp = TempDir::new().expect("tempdir");
    write_store(&tasks_file(temp.path()), &v3_store());

    let output = genie(temp.path(), &["mark", "attempt-9", "running", "--exit-code", "2"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("warning: Migrated 1 task(s) from v3 to v4."));

    let output = genie(temp.path(), &["show", "attempt-9"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("status: failed (2) (persisted: running)"));
    assert!(text.contains("exit code: 2"));

    let output = genie(temp.path(), &["mark", "missing", "completed"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Session not found: missing"));
}

#[test]
fn mark_unknown_id_reports_migration_and_keeps_file() {
    let temp = TempDir::new().expect("tempdir");
    let path = tasks_file(temp.path());
    write_store(&path, &v3_store());
    let before = fs::read_to_string(&path).expect("read");

    let output = genie(temp.path(), &["mark", "nope", "stopped"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("warning: Migrated 1 task(s) from v3 to v4."));
    assert!(err.contains("Session not found: nope"));
    assert_eq!(fs::read_to_string(&path).expect("read"), before);
}

#[test]
fn mark_in_empty_workspace_writes_nothing() {
    let temp = TempDir::new().expect("tempdir");
    let output = genie(temp.path(), &["mark", "nope", "stopped"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Session not found: nope"));
    assert!(!temp.path().join(".genie").exists());
}

#[test]
fn sessions_kind_follows_configured_file() {
    let temp = TempDir::new().expect("tempdir");
    fs::create_dir_all(temp.path().join(".genie")).expect("genie dir");
    fs::write(
        temp.path().join(".genie").join("config.yaml"),
        "paths:\n  sessionsFile: state/sessions.json\n",
    )
    .expect("config");
    write_store(
        &temp.path().join("state").join("sessions.json"),
        &json!({
            "version": 4,
            "sessions": {"s-1": {"agent": "plan", "status": "completed"}}
        }),
    );

    let output = genie(temp.path(), &["--kind", "sessions", "list"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("s-1 | plan | completed | OPENCODE |"));
}

#[test]
fn version_prints_git_stamp() {
    let temp = TempDir::new().expect("tempdir");
    let output = genie(temp.path(), &["version"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.starts_with(&format!("genie {}", env!("CARGO_PKG_VERSION"))));
    assert!(text.contains("+git."));
}
