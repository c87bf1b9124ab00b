//! Integration tests for the sitepool CLI.
//!
//! These run the real binary: `simulate` against in-process and spawned
//! workers, and `worker` mode speaking the line protocol over stdin/stdout.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Get a command for the sitepool binary.
fn sitepool() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("sitepool").unwrap();
    cmd.env_remove("SITEPOOL_CONFIG")
        .env_remove("SITEPOOL_PROCESS_SWAP")
        .env_remove("SITEPOOL_SINGLE_PROCESS")
        .env_remove("SITEPOOL_CACHE_MODEL")
        .env_remove("SITEPOOL_PROCESS_CACHE_SIZE")
        .env_remove("SITEPOOL_LOG")
        .env_remove("RUST_LOG");
    cmd
}

const CROSS_SITE_SCRIPT: &str = r#"{
    "config": {
        "maximum_process_cache_size": 1,
        "uses_back_forward_cache": false,
        "automatic_process_warming": false
    },
    "steps": [
        { "op": "create_page", "page": "tab" },
        { "op": "navigate", "page": "tab", "url": "https://a.example/" },
        { "op": "navigate", "page": "tab", "url": "https://b.example/" },
        { "op": "navigate", "page": "tab", "url": "https://a.example/again" },
        { "op": "close_page", "page": "tab" },
        { "op": "memory_pressure", "critical": false }
    ]
}"#;

fn write_script(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("script.json");
    std::fs::write(&path, contents).unwrap();
    path
}

fn json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_help() {
    sitepool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("--verbose"));
}

#[test]
fn test_version() {
    sitepool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sitepool"));
}

#[test]
fn test_simulate_in_process() {
    let dir = tempdir().unwrap();
    let script = write_script(dir.path(), CROSS_SITE_SCRIPT);

    let output = sitepool()
        .args(["-q", "simulate", "--in-process"])
        .arg(&script)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 7);
    assert_eq!(lines[1]["navigation"]["reason"], "no-committed-load");
    assert_eq!(lines[2]["navigation"]["reason"], "cross-site");
    assert_eq!(lines[2]["navigation"]["swapped"], true);
    assert_eq!(lines[2]["cached_processes"], 1);
    assert_eq!(lines[3]["navigation"]["source"], "cache");
    assert_eq!(lines[5]["cached_processes"], 0);

    let stats = &lines[6]["statistics"];
    assert_eq!(stats["process_swaps"], 2);
    assert_eq!(stats["cache_hits"], 1);
    assert_eq!(stats["crashes"], 0);
}

#[test]
fn test_simulate_with_worker_processes() {
    let dir = tempdir().unwrap();
    let script = write_script(
        dir.path(),
        r#"{
            "config": { "maximum_process_cache_size": 2, "automatic_process_warming": false },
            "steps": [
                { "op": "create_page", "page": "tab" },
                { "op": "navigate", "page": "tab", "url": "https://a.example/" },
                { "op": "navigate", "page": "tab", "url": "https://b.example/" },
                { "op": "crash_gpu" }
            ]
        }"#,
    );

    let output = sitepool()
        .args(["-q", "simulate"])
        .arg(&script)
        .timeout(std::time::Duration::from_secs(60))
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines = json_lines(&output.stdout);
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[1]["committed"], true);
    assert_eq!(lines[2]["committed"], true);
    assert_eq!(lines[2]["navigation"]["swapped"], true);
    assert_eq!(lines[4]["statistics"]["crashes"], 1);
}

#[test]
fn test_config_flag_overrides_script_config() {
    let dir = tempdir().unwrap();
    let script = write_script(dir.path(), CROSS_SITE_SCRIPT);
    let config = dir.path().join("pool.json");
    std::fs::write(&config, r#"{ "uses_single_process": true }"#).unwrap();

    let output = sitepool()
        .args(["-q", "--config"])
        .arg(&config)
        .args(["simulate", "--in-process"])
        .arg(&script)
        .output()
        .unwrap();
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines[2]["navigation"]["reason"], "single-process");
    assert_eq!(lines[2]["navigation"]["swapped"], false);
}

#[test]
fn test_simulate_missing_script() {
    sitepool()
        .args(["simulate", "--in-process", "/nonexistent/script.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("Failed to load script"));
}

#[test]
fn test_simulate_rejects_unknown_step() {
    let dir = tempdir().unwrap();
    let script = write_script(dir.path(), r#"{ "steps": [ { "op": "reboot" } ] }"#);
    sitepool()
        .args(["simulate", "--in-process"])
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("caused by"));
}

#[test]
fn test_simulate_unknown_page() {
    let dir = tempdir().unwrap();
    let script = write_script(
        dir.path(),
        r#"{ "steps": [ { "op": "close_page", "page": "ghost" } ] }"#,
    );
    sitepool()
        .args(["simulate", "--in-process"])
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn test_worker_mode_handshake_and_exit() {
    let output = sitepool()
        .args(["worker", "--role", "content"])
        .write_stdin(
            "{\"receiver\":\"Process\",\"name\":\"Ping\",\"kind\":\"sync\",\"request_id\":1}\n\
             {\"receiver\":\"Process\",\"name\":\"Exit\"}\n",
        )
        .output()
        .unwrap();
    assert!(output.status.success());

    let lines = json_lines(&output.stdout);
    assert_eq!(lines[0]["name"], "DidFinishLaunching");
    assert_eq!(lines[0]["body"]["role"], "content");
    assert_eq!(lines[1]["kind"], "reply");
    assert_eq!(lines[1]["request_id"], 1);
    assert_eq!(lines[1]["body"], "pong");
}

#[test]
fn test_worker_mode_rejects_unknown_role() {
    sitepool()
        .args(["worker", "--role", "printer"])
        .assert()
        .failure();
}
