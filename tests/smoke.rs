//! Smoke tests -- drive the binary end to end against a scratch database.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn scratch_config(dir: &Path) -> PathBuf {
    let path = dir.join("bobsled.toml");
    let db = dir.join("runs.db");
    std::fs::write(
        &path,
        format!(
            "[storage]\nbackend = \"sqlite\"\npath = {:?}\n\n[report]\ndays = 7\n",
            db.display().to_string()
        ),
    )
    .unwrap();
    path
}

fn bobsled(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("bobsled").unwrap();
    cmd.env_remove("BOBSLED_CONFIG").arg("--config").arg(config);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("bobsled")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run history and daily status"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("bobsled")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bobsled"));
}

#[test]
fn test_empty_report() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    bobsled(&config)
        .arg("report")
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs in the last 7 days."));
}

#[test]
fn test_record_and_report_run() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());

    let out = bobsled(&config)
        .args(["runs", "start", "--task", "scrape", "--entity", "nc"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let id = String::from_utf8(out).unwrap().trim().to_string();

    bobsled(&config)
        .args(["runs", "finish", "--id", &id, "--status", "failure", "--detail", "http 503"])
        .assert()
        .success();

    // completed runs are frozen
    bobsled(&config)
        .args(["runs", "finish", "--id", &id, "--status", "success"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("can no longer be modified"));

    bobsled(&config)
        .args(["runs", "list", "--status", "failure"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()).and(predicate::str::contains("http 503")));

    bobsled(&config)
        .args(["report", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"bad\"").and(predicate::str::contains("\"nc\"")));
}

#[test]
fn test_finish_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    bobsled(&config)
        .args([
            "runs",
            "finish",
            "--id",
            "6f1c2b3a-0000-4000-8000-000000000000",
            "--status",
            "success",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_invalid_status_filter_rejected() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    bobsled(&config)
        .args(["runs", "list", "--status", "done"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid filter"));
}

#[test]
fn test_load_and_list_tasks() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());
    let tasks = dir.path().join("tasks.toml");
    std::fs::write(
        &tasks,
        "[[task]]\nname = \"nc-scrape\"\nentrypoint = \"scrape nc\"\n\n[[task]]\nname = \"ak-scrape\"\n",
    )
    .unwrap();

    bobsled(&config)
        .args(["tasks", "load"])
        .arg(&tasks)
        .assert()
        .success()
        .stdout(predicate::str::contains("Loaded 2 tasks."));

    bobsled(&config)
        .args(["tasks", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nc-scrape").and(predicate::str::contains("ak-scrape")));
}

#[test]
fn test_oversized_report_window_rejected() {
    let dir = TempDir::new().unwrap();
    let config = scratch_config(dir.path());

    bobsled(&config)
        .args(["report", "--days", "4294967295"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("report window"));
}

#[test]
fn test_broken_env_config_warning_is_logged() {
    let dir = TempDir::new().unwrap();
    let broken = dir.path().join("broken.toml");
    std::fs::write(&broken, "[storage\nbackend = ").unwrap();

    // falls back to defaults, so the default database lands under the scratch dir
    Command::cargo_bin("bobsled")
        .unwrap()
        .current_dir(dir.path())
        .env("BOBSLED_CONFIG", &broken)
        .env_remove("RUST_LOG")
        .args(["runs", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No runs found."))
        .stderr(predicate::str::contains(
            "BOBSLED_CONFIG set but file could not be loaded",
        ));
}
