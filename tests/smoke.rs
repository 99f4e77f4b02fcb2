//! Smoke tests -- verify the binary runs and each subcommand behaves.

use assert_cmd::Command;
use predicates::prelude::*;

fn accelpipe() -> Command {
    let mut cmd = Command::cargo_bin("accelpipe").unwrap();
    cmd.current_dir(env!("CARGO_MANIFEST_DIR"))
        .env_remove("ACCELPIPE_CONFIG")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_help() {
    accelpipe()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Overlapped offload"));
}

#[test]
fn test_cli_version() {
    accelpipe()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("accelpipe"));
}

#[test]
fn test_kernels_lists_compute_functions() {
    accelpipe()
        .arg("kernels")
        .assert()
        .success()
        .stdout(
            predicates::str::contains("vec_add")
                .and(predicates::str::contains("polynomial_op"))
                .and(predicates::str::contains("heavy_compute")),
        );
}

#[test]
fn test_devices_json() {
    let output = accelpipe().args(["devices", "--json"]).output().unwrap();
    assert!(output.status.success());
    let devices: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let kinds: Vec<&str> = devices
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["gpu", "fpga"]);
}

#[test]
fn test_cpu_run_verifies() {
    accelpipe()
        .args(["run", "4096", "5", "cpu", "--verify"])
        .assert()
        .success()
        .stdout(predicates::str::contains("5 / 5").and(predicates::str::contains("0 mismatches")));
}

#[test]
fn test_gpu_run_with_default_program_json() {
    let output = accelpipe()
        .args(["run", "2048", "4", "gpu", "--verify", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["backend"], "gpu");
    assert_eq!(report["op"], "polynomial_op");
    assert_eq!(report["tasks_processed"], 4);
    assert_eq!(report["verification"]["mismatches"], 0);
}

#[test]
fn test_fpga_run_with_explicit_binary() {
    accelpipe()
        .args(["run", "512", "3", "fpga", "kernels/fpga/krnl_vadd.xclbin"])
        .assert()
        .success()
        .stdout(predicates::str::contains("vec_add"));
}

#[test]
fn test_zero_length_rejected() {
    accelpipe()
        .args(["run", "0", "3", "cpu"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("vector length"));
}

#[test]
fn test_unknown_device_rejected() {
    accelpipe()
        .args(["run", "16", "2", "tpu"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid device type"));
}

#[test]
fn test_missing_program_fails() {
    accelpipe()
        .args(["run", "16", "2", "gpu", "kernels/gpu/does_not_exist.cl"])
        .assert()
        .failure();
}

#[test]
fn test_config_file_is_applied() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("accelpipe.toml");
    std::fs::write(&path, "[run]\nvector_len = 64\ntasks = 2\n").unwrap();

    accelpipe()
        .arg("--config")
        .arg(&path)
        .args(["run", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"vector_len\": 64"));
}
