mod common;

use assert_cmd::Command;
use predicates::prelude::*;

use common::{compile_test_binary, COLLECTOR_AWARE_SUITE, SAMPLE_SUITE};

fn vstest() -> Command {
    let mut cmd = Command::cargo_bin("vstest").unwrap();
    cmd.timeout(std::time::Duration::from_secs(120));
    cmd
}

#[test]
fn test_no_command_prints_usage() {
    vstest()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_testhost_requires_endpoint() {
    vstest()
        .arg("testhost")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--endpoint <ENDPOINT>"));
}

#[test]
fn test_unknown_transport_rejected() {
    vstest()
        .args(["testhost", "--endpoint", "127.0.0.1:1", "--transport", "pigeon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown transport 'pigeon'"));
}

#[test]
fn test_run_requires_a_source() {
    vstest()
        .args(["run", "--verbose"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("<SOURCES>..."));
}

#[test]
fn test_help_lists_subcommands() {
    vstest()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("discover"))
        .stdout(predicate::str::contains("datacollector"));
}

#[test]
fn test_discover_missing_binary_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("not_built");
    vstest()
        .current_dir(dir.path())
        .arg("discover")
        .arg(&missing)
        .assert()
        .success()
        .stdout(predicate::str::contains("Warning: Could not list tests"))
        .stdout(predicate::str::contains("Discovered 0 test(s)."));
}

#[test]
fn test_discover_libtest_binary() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), SAMPLE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    vstest()
        .current_dir(dir.path())
        .arg("discover")
        .arg(&suite)
        .assert()
        .success()
        .stdout(predicate::str::contains("math::adds"))
        .stdout(predicate::str::contains("math::subtracts_badly"))
        .stdout(predicate::str::contains("Discovered 3 test(s)."));
}

#[test]
fn test_run_libtest_binary_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), SAMPLE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    vstest()
        .current_dir(dir.path())
        .arg("run")
        .arg(&suite)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed math::subtracts_badly"))
        .stdout(predicate::str::contains("sum was off"))
        .stdout(predicate::str::contains("Failed! - Failed: 1, Passed: 1"));
}

#[test]
fn test_run_selected_libtest_test() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), SAMPLE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    vstest()
        .current_dir(dir.path())
        .arg("run")
        .arg(&suite)
        .args(["--tests", "math::adds", "--verbose"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Passed math::adds"))
        .stdout(predicate::str::contains("Passed! - Failed: 0, Passed: 1"));
}

#[test]
fn test_collect_sets_testhost_environment() {
    let dir = tempfile::tempdir().unwrap();
    let Some(suite) = compile_test_binary(dir.path(), COLLECTOR_AWARE_SUITE) else {
        eprintln!("rustc not available, skipping");
        return;
    };
    vstest()
        .current_dir(dir.path())
        .arg("run")
        .arg(&suite)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Failed collector::sees_timing_collector"));

    vstest()
        .current_dir(dir.path())
        .arg("run")
        .arg(&suite)
        .arg("--collect")
        .assert()
        .success()
        .stdout(predicate::str::contains("Passed! - Failed: 0, Passed: 1"));
}
