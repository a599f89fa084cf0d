//! CLI tests for error exit codes.
//!
//! Spawns the kci binary with an isolated `HOME` and working directory and
//! checks that every failure exits with `ERROR`, never with a verdict code.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use kci::core::types::Mark;
use kci::exit_codes;
use kci::io::bisect_state::{BisectParams, BisectState, StateLock, write_bisect_state};
use kci::test_support::TestRepo;

const SETTINGS: &str = r#"
default_instance = "local"

[instances.local]
pipeline = "http://127.0.0.1:9"
api = "http://127.0.0.1:9"
"#;

fn kci(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kci"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env_remove("KCI_DEV_TOKEN")
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn kci")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn usage_error_exits_with_error_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = kci(
        temp.path(),
        &["checkout", "--giturl", "u", "--branch", "b", "--commit", "c", "--test", "t"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
}

#[test]
fn help_exits_cleanly() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = kci(temp.path(), &["--help"]);
    assert_eq!(output.status.code(), Some(exit_codes::PASSED));
    assert!(String::from_utf8_lossy(&output.stdout).contains("bisect"));
}

#[test]
fn fresh_bisect_without_boundaries_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = kci(temp.path(), &["bisect", "--good", "aaa111"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    let err = stderr(&output);
    assert!(err.contains("no saved bisection to resume"), "{err}");
    assert!(err.contains("--giturl"), "{err}");
    assert!(!temp.path().join("kci-bisect.json").exists());
}

#[test]
fn invalid_settings_fail() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join(".kci-dev.toml"),
        "[watch]\npoll_interval_secs = 0\n",
    )
    .expect("write settings");
    let output = kci(temp.path(), &["watch", "--treeid", "f00d"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(stderr(&output).contains("poll_interval_secs"));
}

#[test]
fn watch_without_instance_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = kci(temp.path(), &["watch", "--treeid", "f00d"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(stderr(&output).contains("no instance selected"));
}

#[test]
fn checkout_without_token_fails_before_contacting_maestro() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join(".kci-dev.toml"), SETTINGS).expect("write settings");
    let output = kci(
        temp.path(),
        &["checkout", "--giturl", "u", "--branch", "b", "--commit", "ccc333"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(stderr(&output).contains("no Maestro token configured"));
}

#[test]
fn locked_state_file_fails() {
    let repo = TestRepo::with_commits(3).expect("repo");
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join(".kci-dev.toml"), SETTINGS).expect("write settings");
    let state_path = temp.path().join("kci-bisect.json");

    let mut state = BisectState::new(BisectParams {
        tree_url: repo.path().display().to_string(),
        branch: "master".to_string(),
        good_commit: repo.commit(0).to_string(),
        bad_commit: repo.commit(2).to_string(),
        retry_count: 0,
        job_filter: Vec::new(),
        platform_filter: Vec::new(),
        test_name: "baseline.login".to_string(),
        workdir: repo.path().to_path_buf(),
    });
    state.initialized = true;
    state.next_candidate = Some(repo.commit(1).to_string());
    state.record(repo.commit(1), Mark::Skip);
    write_bisect_state(&state_path, &state).expect("write state");
    let before = fs::read_to_string(&state_path).expect("read state");

    let _lock = StateLock::acquire(&state_path).expect("lock");
    let output = kci(temp.path(), &["bisect"]);
    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    assert!(stderr(&output).contains("locked by another kci process"));
    assert_eq!(fs::read_to_string(&state_path).expect("read state"), before);
}
