use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn sweep() -> Command {
    Command::cargo_bin("sweep").expect("sweep binary")
}

const MANIFEST: &str = r#"---
name: "SLURM"
partition: "accelerated"
job-name: "cli_test"
time: 60

---
name: "cli_exp"
repetitions: 2
iterations: 100
params:
  algorithm:
    lr: 0.001
  projection:
    args:
      total_train_steps: 100
grid:
  algorithm:
    lr: [0.001, 0.01]
"#;

#[test]
fn validate_accepts_a_well_formed_manifest() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, MANIFEST).expect("fixture");

    sweep()
        .arg("validate")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"))
        .stdout(predicate::str::contains("total_runs: 4"));
}

#[test]
fn validate_fails_with_json_error_envelope() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("dangling.yml");
    fs::write(
        &path,
        "name: \"exp\"\nimport_path: \"missing.yml\"\nimport_exp: \"base\"\n",
    )
    .expect("fixture");

    sweep()
        .arg("validate")
        .arg(&path)
        .arg("--json")
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"ok\": false"))
        .stdout(predicate::str::contains("reference_error"));
}

#[test]
fn validate_reports_parse_errors_on_stderr_in_plain_mode() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("broken.yml");
    fs::write(&path, "name: [unclosed\n").expect("fixture");

    sweep()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("parse error"));
}

#[test]
fn describe_prints_the_sweep_shape() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, MANIFEST).expect("fixture");

    sweep()
        .arg("describe")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("experiment: cli_exp"))
        .stdout(predicate::str::contains("partition: accelerated"))
        .stdout(predicate::str::contains("grid: algorithm.lr (2 values)"))
        .stdout(predicate::str::contains("total_runs: 4"));
}

#[test]
fn expand_json_lists_every_run() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, MANIFEST).expect("fixture");

    let output = sweep()
        .arg("expand")
        .arg(&path)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let payload: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(payload["ok"], serde_json::json!(true));
    assert_eq!(payload["total_runs"], serde_json::json!(4));
    assert_eq!(payload["runs"].as_array().map(|r| r.len()), Some(4));
}

#[test]
fn expand_repetitions_flag_overrides_the_manifest() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, MANIFEST).expect("fixture");

    sweep()
        .arg("expand")
        .arg(&path)
        .arg("--repetitions")
        .arg("3")
        .assert()
        .success()
        .stdout(predicate::str::contains("total_runs: 6"));
}

#[test]
fn expand_writes_the_run_plan_artifact() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, MANIFEST).expect("fixture");
    let plan = dir.path().join("runs.json");

    sweep()
        .arg("expand")
        .arg(&path)
        .arg("--out")
        .arg(&plan)
        .assert()
        .success();

    let payload: serde_json::Value =
        serde_json::from_slice(&fs::read(&plan).expect("plan file")).expect("plan json");
    assert_eq!(payload["schema_version"], serde_json::json!("run_plan_v1"));
    assert_eq!(payload["total_runs"], serde_json::json!(4));
}

#[test]
fn init_writes_a_manifest_that_validates() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");

    sweep()
        .arg("init")
        .arg("--out")
        .arg(&path)
        .assert()
        .success();

    sweep().arg("validate").arg(&path).assert().success();
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("sweep.yml");
    fs::write(&path, "existing").expect("fixture");

    sweep()
        .arg("init")
        .arg("--out")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    sweep()
        .arg("init")
        .arg("--out")
        .arg(&path)
        .arg("--force")
        .assert()
        .success();
}
