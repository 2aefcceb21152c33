#![allow(clippy::unwrap_used)]

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    cargo_bin_cmd!("switchyard")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("classify"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("quota"));
}

#[test]
fn classify_prints_json_on_stdout() {
    cargo_bin_cmd!("switchyard")
        .args(["classify", "implement a function that parses dates"])
        .env("RUST_LOG", "debug")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""task_type": "code""#))
        .stderr(predicate::str::contains("classified"));
}

#[test]
fn config_prints_profile_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
profile = "cheap"

[router]
terminal_agent = "local"

[profiles.cheap]
mode = "fallback-only"
default_timeout_ms = 9000
"#
    )
    .unwrap();

    cargo_bin_cmd!("switchyard")
        .arg("config")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""terminal_agent": "local""#))
        .stdout(predicate::str::contains(r#""default_timeout_ms": 9000"#))
        .stdout(predicate::str::contains(r#""mode": "fallback-only""#));
}

#[test]
fn config_rejects_unknown_profile() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "profile = \"missing\"").unwrap();

    cargo_bin_cmd!("switchyard")
        .arg("config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown profile `missing`"));
}

#[test]
fn quota_normalizes_retry_after() {
    cargo_bin_cmd!("switchyard")
        .args([
            "quota",
            "429 Too Many Requests; retry-after: 90",
            "--now",
            "2030-01-01T00:00:00Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""detected": true"#))
        .stdout(predicate::str::contains(r#""reset_at": "2030-01-01T00:01:30Z""#))
        .stdout(predicate::str::contains(r#""source": "retry_after""#));
}
