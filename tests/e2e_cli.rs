//! CLI end-to-end tests
//!
//! Tests for the chainforge command-line interface, run against the built-in
//! mock adapters so no provider is ever called.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

/// Get a command for the chainforge binary
#[allow(deprecated)]
fn chainforge_cmd() -> Command {
    let mut cmd = Command::cargo_bin("chainforge").unwrap();
    cmd.env_remove("CHAINFORGE_BUDGET").env_remove("RUST_LOG");
    cmd
}

/// Command that can be fed stdin, for the confirmation prompt
#[allow(deprecated)]
fn chainforge_stdin_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("chainforge").unwrap();
    cmd.env_remove("CHAINFORGE_BUDGET").env_remove("RUST_LOG");
    cmd
}

fn demos_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos")
}

/// Write a chain definition whose output and temp dirs live under `dir`.
fn write_chain(dir: &Path, extra: &str, steps: &str) -> PathBuf {
    let path = dir.join("chain.yaml");
    let yaml = format!(
        "name: e2e\ninitial_input: \"a kite over the dunes\"\noutput_dir: {}\ntemp_dir: {}\n{extra}steps:\n{steps}",
        dir.join("out").display(),
        dir.join("tmp").display(),
    );
    fs::write(&path, yaml).unwrap();
    path
}

const TWO_STEPS: &str = "  - type: text_to_image\n  - type: upscale_image\n";

fn reports_in(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with("chain_report_"))
                .unwrap_or(false)
        })
        .collect()
}

#[test]
fn test_cli_no_args_shows_help() {
    let mut cmd = chainforge_cmd();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_help_flag() {
    let mut cmd = chainforge_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("chainforge"))
        .stdout(predicate::str::contains("run-chain"))
        .stdout(predicate::str::contains("list-models"));
}

#[test]
fn test_cli_version_flag() {
    let mut cmd = chainforge_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("chainforge"));
}

#[test]
fn test_cli_list_models() {
    let mut cmd = chainforge_cmd();
    cmd.arg("list-models")
        .assert()
        .success()
        .stdout(predicate::str::contains("text_to_image"))
        .stdout(predicate::str::contains("mock"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("select"));
}

#[test]
fn test_cli_list_models_json_is_stable() {
    let first = chainforge_cmd()
        .args(["list-models", "--json"])
        .output()
        .unwrap();
    let second = chainforge_cmd()
        .args(["list-models", "--json"])
        .output()
        .unwrap();
    assert!(first.status.success());
    assert_eq!(first.stdout, second.stdout);

    let rows: serde_json::Value = serde_json::from_slice(&first.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 22);
    assert!(rows.iter().all(|r| r["model"] == "mock" || r["model"] == "exec"));
}

#[test]
fn test_cli_list_models_filter() {
    let output = chainforge_cmd()
        .args(["list-models", "--json", "--step-type", "upscale-video"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["step_type"] == "upscale_video"));
}

#[test]
fn test_cli_list_models_unknown_step_type() {
    let mut cmd = chainforge_cmd();
    cmd.args(["list-models", "--step-type", "text_to_smell"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown step type"));
}

#[test]
fn test_cli_validate_demos() {
    for demo in ["storyboard.yaml", "variants.yaml", "best_of.yaml", "first_success.json"] {
        let mut cmd = chainforge_cmd();
        cmd.args(["validate", "--config"])
            .arg(demos_dir().join(demo))
            .assert()
            .success()
            .stdout(predicate::str::contains("Chain is valid"));
    }
}

#[test]
fn test_cli_validate_incompatible_chain() {
    let temp = tempdir().unwrap();
    let config = write_chain(
        temp.path(),
        "",
        "  - type: text_to_image\n  - type: add_audio\n",
    );
    let mut cmd = chainforge_cmd();
    cmd.args(["validate", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Incompatible chain at step 1"));
}

#[test]
fn test_cli_validate_unknown_key() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "budjet: 1.0\n", TWO_STEPS);
    let mut cmd = chainforge_cmd();
    cmd.args(["validate", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("budjet"));
}

#[test]
fn test_cli_run_chain_completes() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "save_intermediates: true\n", TWO_STEPS);

    let mut cmd = chainforge_cmd();
    cmd.args(["run-chain", "--no-confirm", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: COMPLETED"))
        .stdout(predicate::str::contains("Report:"));

    let out = temp.path().join("out");
    assert_eq!(reports_in(&out).len(), 1);
    let artifacts = fs::read_dir(&out).unwrap().count() - 1;
    assert_eq!(artifacts, 2);
    assert!(out.join("0_text_to_image.png").is_file());
    assert!(out.join("1_upscale_image.png").is_file());
}

#[test]
fn test_cli_run_chain_input_text_override() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "", "  - type: prompt_generation\n");

    let mut cmd = chainforge_cmd();
    cmd.args(["run-chain", "--no-confirm", "--input-text", "a red kite", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("a red kite, cinematic lighting"));
}

#[test]
fn test_cli_run_chain_budget_flag() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "", TWO_STEPS);

    let mut cmd = chainforge_cmd();
    cmd.args(["run-chain", "--no-confirm", "--budget", "0.01", "--config"])
        .arg(&config)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Budget exceeded"));

    assert!(!temp.path().join("out").exists());
}

#[test]
fn test_cli_run_chain_budget_env() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "", TWO_STEPS);

    let mut cmd = chainforge_cmd();
    cmd.env("CHAINFORGE_BUDGET", "0.02")
        .args(["run-chain", "--no-confirm", "--config"])
        .arg(&config)
        .assert()
        .code(3);
}

#[test]
fn test_cli_run_chain_declined() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "", TWO_STEPS);

    let mut cmd = chainforge_stdin_cmd();
    cmd.args(["run-chain", "--config"])
        .arg(&config)
        .write_stdin("n\n")
        .assert()
        .code(4)
        .stdout(predicate::str::contains("Proceed?"))
        .stderr(predicate::str::contains("declined"));
}

#[test]
fn test_cli_run_chain_confirmed() {
    let temp = tempdir().unwrap();
    let config = write_chain(temp.path(), "", TWO_STEPS);

    let mut cmd = chainforge_stdin_cmd();
    cmd.args(["run-chain", "--config"])
        .arg(&config)
        .write_stdin("y\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"));
}

#[test]
fn test_cli_aborted_run_writes_report() {
    let temp = tempdir().unwrap();
    let config = write_chain(
        temp.path(),
        "",
        "  - type: text_to_image\n  - type: upscale_image\n    params: {simulate_failure: provider}\n  - type: image_to_video\n",
    );

    let mut cmd = chainforge_cmd();
    cmd.args(["run-chain", "--no-confirm", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Status: ABORTED"))
        .stdout(predicate::str::contains("simulated provider failure"));

    let reports = reports_in(&temp.path().join("out"));
    assert_eq!(reports.len(), 1);

    let mut cmd = chainforge_cmd();
    cmd.arg("report")
        .arg(&reports[0])
        .assert()
        .success()
        .stdout(predicate::str::contains("ABORTED"))
        .stdout(predicate::str::contains("step 1 (upscale_image) failed"));

    let raw = chainforge_cmd()
        .args(["report", "--json"])
        .arg(&reports[0])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&raw.stdout).unwrap();
    assert_eq!(report["status"], "ABORTED");
    assert_eq!(report["aborted"], true);
    assert_eq!(report["steps"].as_array().unwrap().len(), 2);
}

#[test]
fn test_cli_run_chain_parallel_group() {
    let temp = tempdir().unwrap();
    let config = write_chain(
        temp.path(),
        "save_intermediates: true\n",
        "  - type: parallel_group\n    members:\n      - type: text_to_image\n      - type: text_to_image\n        params: {width: 2048}\n  - type: select\n    params: {index: 1}\n",
    );

    let mut cmd = chainforge_cmd();
    cmd.args(["run-chain", "--no-confirm", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"));

    let out = temp.path().join("out");
    assert!(out.join("0_0_text_to_image.png").is_file());
    assert!(out.join("0_1_text_to_image.png").is_file());
    assert!(out.join("1_select.png").is_file());
}

#[test]
fn test_cli_report_missing_file() {
    let mut cmd = chainforge_cmd();
    cmd.args(["report", "/nonexistent/chain_report.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}
