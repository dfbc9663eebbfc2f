//! Command-line contract of the binary. Nothing here touches the network.

use assert_cmd::Command;
use predicates::prelude::*;

fn harvester() -> Command {
    Command::cargo_bin("oaipmh-harvester").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    harvester()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvest"))
        .stdout(predicate::str::contains("identify"));
}

#[test]
fn test_harvest_help_lists_options() {
    harvester()
        .args(["harvest", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--url"))
        .stdout(predicate::str::contains("--verb"))
        .stdout(predicate::str::contains("--prefix"))
        .stdout(predicate::str::contains("--rotate-every"))
        .stdout(predicate::str::contains("--no-resume"));
}

#[test]
fn test_missing_url_is_usage_error() {
    harvester()
        .args(["harvest", "--prefix", "edm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--url"));
}

#[test]
fn test_invalid_url_fails_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    harvester()
        .args(["harvest", "--url", "ftp://example.org/oai", "--prefix", "edm", "--dir"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error: Invalid base URL"));
}

#[test]
fn test_unknown_verb_is_rejected() {
    harvester()
        .args([
            "harvest",
            "--url",
            "https://example.org/oai",
            "--prefix",
            "edm",
            "--verb",
            "GetRecord",
        ])
        .assert()
        .failure();
}
