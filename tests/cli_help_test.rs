// Command-line surface of the trial-onboarding binary

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_every_command() {
    let mut cmd = Command::cargo_bin("trial-onboarding").unwrap();

    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("onboard"))
        .stdout(predicate::str::contains("onboard-async"))
        .stdout(predicate::str::contains("workflow-status"))
        .stdout(predicate::str::contains("race"));
}

#[test]
fn test_site_argument_must_be_name_and_country() {
    let mut cmd = Command::cargo_bin("trial-onboarding").unwrap();

    cmd.args(["onboard", "--name", "T1", "--phase", "Phase I", "--site", "Mayo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected NAME:COUNTRY"));
}

#[test]
fn test_onboard_prints_saga_response() {
    let mut cmd = Command::cargo_bin("trial-onboarding").unwrap();

    cmd.args([
        "onboard", "--name", "T1", "--phase", "Phase I", "--site", "A:US", "--site", "B:UK",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"success\": true"))
    .stdout(predicate::str::contains("register_site_2"));
}

#[test]
fn test_onboard_with_invalid_phase_reports_failure() {
    let mut cmd = Command::cargo_bin("trial-onboarding").unwrap();

    cmd.args(["onboard", "--name", "T1", "--phase", "Phase X"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": false"))
        .stdout(predicate::str::contains("Invalid phase: Phase X"));
}

#[test]
fn test_race_rejects_one_update() {
    let mut cmd = Command::cargo_bin("trial-onboarding").unwrap();

    cmd.args(["race", "--name", "T1", "--phase", "Phase I", "--new-phase", "Phase II"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected (stale_data)"));
}
