#![allow(missing_docs)]

use assert_cmd::Command;
use assert_fs::fixture::ChildPath;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

const VE_CSV: &str = "RPM,20,40\n1000,0.8000,0.8000\n2000,0.8000,0.8000\n";

fn log_json() -> String {
    let mut samples = Vec::new();
    for _ in 0..20 {
        for &rpm in &[1000.0, 2000.0] {
            for &map_kpa in &[20.0, 40.0] {
                samples.push(format!(
                    "{{\"rpm\":{rpm},\"map_kpa\":{map_kpa},\"afr_cmd_front\":13.5,\"afr_meas_front\":13.5,\"afr_cmd_rear\":13.5,\"afr_meas_rear\":13.5}}"
                ));
            }
        }
    }
    format!("[{}]", samples.join(","))
}

fn write_fixtures(dir: &TempDir) -> (ChildPath, ChildPath, ChildPath) {
    let base_front = dir.child("base_front.csv");
    let base_rear = dir.child("base_rear.csv");
    let log = dir.child("log.json");
    base_front.write_str(VE_CSV).unwrap();
    base_rear.write_str(VE_CSV).unwrap();
    log.write_str(&log_json()).unwrap();
    (base_front, base_rear, log)
}

#[test]
fn help() {
    Command::cargo_bin("dynoai")
        .unwrap()
        .args(["analyze", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--base-front"))
        .stdout(predicate::str::contains("--base-rear"));
}

#[test]
fn identity_samples_write_a_run_directory() {
    let dir = TempDir::new().unwrap();
    let (base_front, base_rear, log) = write_fixtures(&dir);
    let run_dir = dir.child("run");

    Command::cargo_bin("dynoai")
        .unwrap()
        .args([
            "analyze",
            "--log",
            log.path().to_str().unwrap(),
            "--base-front",
            base_front.path().to_str().unwrap(),
            "--base-rear",
            base_rear.path().to_str().unwrap(),
            "--out",
            run_dir.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("coverage"));

    run_dir.child("factors_front.json").assert(predicate::path::exists());
    run_dir.child("factors_rear.json").assert(predicate::path::exists());
    run_dir.child("diagnostics.json").assert(predicate::path::exists());
    run_dir.child("input/base_front.csv").assert(predicate::path::exists());
    run_dir.child("input/log.json").assert(predicate::path::exists());
}

#[test]
fn dry_run_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let (base_front, base_rear, log) = write_fixtures(&dir);
    let run_dir = dir.child("run");

    Command::cargo_bin("dynoai")
        .unwrap()
        .args([
            "analyze",
            "--log",
            log.path().to_str().unwrap(),
            "--base-front",
            base_front.path().to_str().unwrap(),
            "--base-rear",
            base_rear.path().to_str().unwrap(),
            "--out",
            run_dir.path().to_str().unwrap(),
            "--dry-run",
        ])
        .assert()
        .success();

    run_dir.assert(predicate::path::missing());
}

#[test]
fn mismatched_grids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let base_front = dir.child("base_front.csv");
    let base_rear = dir.child("base_rear.csv");
    let log = dir.child("log.json");
    base_front.write_str(VE_CSV).unwrap();
    base_rear.write_str("RPM,20,40,60\n1000,0.8,0.8,0.8\n2000,0.8,0.8,0.8\n").unwrap();
    log.write_str("[]").unwrap();

    Command::cargo_bin("dynoai")
        .unwrap()
        .args([
            "analyze",
            "--log",
            log.path().to_str().unwrap(),
            "--base-front",
            base_front.path().to_str().unwrap(),
            "--base-rear",
            base_rear.path().to_str().unwrap(),
            "--dry-run",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("different grids"));
}
