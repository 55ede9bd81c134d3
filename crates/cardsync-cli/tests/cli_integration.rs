//! CLI Integration Tests
//!
//! These tests drive the binary end-to-end against a temporary data
//! directory. None of them need a reachable peer.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Test Utilities
// ============================================================================

/// Create a CLI command with a temporary data directory
fn cli_cmd(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cardsync").expect("Failed to find cardsync binary");
    cmd.arg("--data-dir").arg(data_dir.path());
    cmd
}

/// Extract card ID from CLI output (assumes format: "  ID: <ulid>")
fn extract_card_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("  ID: "))
        .map(|id| id.trim().to_string())
}

// ============================================================================
// Help and Version
// ============================================================================

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("cardsync")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("offer"))
        .stdout(predicate::str::contains("answer"))
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn test_version() {
    Command::cargo_bin("cardsync")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cardsync"));
}

#[test]
fn test_missing_subcommand_fails() {
    Command::cargo_bin("cardsync").unwrap().assert().failure();
}

// ============================================================================
// Local Project Commands
// ============================================================================

#[test]
fn test_list_empty_project() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No cards."));
}

#[test]
fn test_add_then_list() {
    let data_dir = TempDir::new().unwrap();
    let audio = data_dir.path().join("take1.wav");
    std::fs::write(&audio, vec![7u8; 4096]).unwrap();

    let output = cli_cmd(&data_dir)
        .args(["add", "Verse idea"])
        .arg(&audio)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let id = extract_card_id(&stdout).expect("add prints the card id");

    cli_cmd(&data_dir).args(["add", "Chorus"]).assert().success();

    cli_cmd(&data_dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 card(s)"))
        .stdout(predicate::str::contains(id))
        .stdout(predicate::str::contains("Verse idea"))
        .stdout(predicate::str::contains("4096 audio bytes"))
        .stdout(predicate::str::contains("Chorus"));
}

#[test]
fn test_add_missing_audio_file_fails() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["add", "Ghost", "/nonexistent/take.wav"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));

    cli_cmd(&data_dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No cards."));
}

// ============================================================================
// Config
// ============================================================================

#[test]
fn test_config_defaults() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"chunk_size\": 16384"))
        .stdout(predicate::str::contains("\"high_water_mark\": 65536"));
}

#[test]
fn test_config_file_overrides() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("sync.json");
    std::fs::write(&config, r#"{ "heartbeat_interval_ms": 1000, "pong_timeout_ms": 4000 }"#)
        .unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"heartbeat_interval_ms\": 1000"))
        .stdout(predicate::str::contains("\"pong_timeout_ms\": 4000"))
        .stdout(predicate::str::contains("\"chunk_size\": 16384"));
}

#[test]
fn test_invalid_config_rejected() {
    let data_dir = TempDir::new().unwrap();
    let config = data_dir.path().join("sync.json");
    std::fs::write(&config, r#"{ "chunk_size": 0 }"#).unwrap();

    cli_cmd(&data_dir)
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("chunk_size"));
}

// ============================================================================
// Handshake Errors
// ============================================================================

#[test]
fn test_answer_rejects_garbage_code() {
    let data_dir = TempDir::new().unwrap();

    cli_cmd(&data_dir)
        .args(["answer", "not-a-handshake-code"])
        .write_stdin("")
        .assert()
        .failure();
}

#[test]
fn test_logs_written_to_log_dir() {
    let data_dir = TempDir::new().unwrap();
    let log_dir = data_dir.path().join("custom-logs");

    cli_cmd(&data_dir)
        .arg("--log-dir")
        .arg(&log_dir)
        .arg("-vv")
        .arg("list")
        .assert()
        .success();

    let raw = log_dir.join("raw");
    let files: Vec<_> = std::fs::read_dir(&raw).unwrap().collect();
    assert_eq!(files.len(), 1);
}
