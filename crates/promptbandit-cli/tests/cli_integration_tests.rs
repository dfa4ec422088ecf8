//! CLI integration tests for promptbandit
//!
//! Each test points PROMPTBANDIT_CONFIG_DIR at its own temp directory, so the
//! config file and database never leak between tests.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn promptbandit_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("promptbandit").unwrap();
    cmd.env("PROMPTBANDIT_CONFIG_DIR", config_dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_templates_list_shows_seeded_templates() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["templates", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("constitutional_v1_0"))
        .stdout(predicate::str::contains("adaptive_general_v1_0"));

    assert!(dir.path().join("promptbandit.db").exists());
}

#[test]
fn test_templates_seed_is_idempotent() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["templates", "seed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already registered"));
}

#[test]
fn test_select_honours_category() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args([
            "select",
            "--category",
            "fairness_aware",
            "--principle",
            "Treat every applicant equally",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Selected: fairness_aware_v1_0"))
        .stdout(predicate::str::contains("- Treat every applicant equally"));
}

#[test]
fn test_simulate_then_metrics() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args([
            "simulate",
            "--rounds",
            "8",
            "--algorithm",
            "ucb1",
            "--seed",
            "3",
            "--requirement",
            "Require MFA for admin actions",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("8 observations"));

    let output = promptbandit_cmd(&dir)
        .args(["metrics", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let metrics: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(metrics["total_optimizations"], 8);
    assert_eq!(metrics["total_template_uses"], 8);
    assert_eq!(metrics["registered_templates"], 4);

    promptbandit_cmd(&dir)
        .args(["metrics", "--prometheus"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mab_total_optimizations_total 8"));

    let export_dir = dir.path().join("export");
    promptbandit_cmd(&dir)
        .args(["export", export_dir.to_str().unwrap()])
        .assert()
        .success();
    let performance = std::fs::read_to_string(export_dir.join("performance.jsonl")).unwrap();
    assert_eq!(performance.lines().count(), 8);
}

#[test]
fn test_top_json_is_ranked() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["simulate", "--rounds", "6", "--quiet"])
        .assert()
        .success();

    let output = promptbandit_cmd(&dir)
        .args(["top", "-k", "2", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let top: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(top.len(), 2);
    assert!(top[0]["average_reward"].as_f64() >= top[1]["average_reward"].as_f64());
}

#[test]
fn test_deactivate_and_activate() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["templates", "deactivate", "constitutional_v1_0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deactivated constitutional_v1_0"));

    // falls back to the adaptive template
    promptbandit_cmd(&dir)
        .args(["select", "--category", "constitutional"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Selected: adaptive_general_v1_0"));

    promptbandit_cmd(&dir)
        .args(["templates", "activate", "constitutional_v1_0"])
        .assert()
        .success();

    promptbandit_cmd(&dir)
        .args(["select", "--category", "constitutional"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Selected: constitutional_v1_0"));
}

#[test]
fn test_unknown_template_fails() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["templates", "show", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_set_get_reset() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["config", "set", "mab.algorithm", "epsilon_greedy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set mab.algorithm = epsilon_greedy"));

    promptbandit_cmd(&dir)
        .args(["config", "get", "mab.algorithm"])
        .assert()
        .success()
        .stdout(predicate::str::contains("epsilon_greedy"));

    assert!(dir.path().join("config.toml").exists());

    promptbandit_cmd(&dir)
        .args(["config", "reset"])
        .assert()
        .success();

    promptbandit_cmd(&dir)
        .args(["config", "get", "mab.algorithm"])
        .assert()
        .success()
        .stdout(predicate::str::contains("thompson_sampling"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["config", "set", "mab.exploration_rate", "1.5"])
        .assert()
        .failure();

    promptbandit_cmd(&dir)
        .args(["config", "set", "llm.api_key", "sk-secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("environment variable"));
}

#[test]
fn test_config_list_includes_storage_path() {
    let dir = TempDir::new().unwrap();

    promptbandit_cmd(&dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("storage.database_path"))
        .stdout(predicate::str::contains("llm.provider = offline"));
}
