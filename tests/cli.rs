use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_version() {
    Command::cargo_bin("snoolink")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("snoolink")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("snoolink"))
        .stdout(predicate::str::contains("--version"))
        .stdout(predicate::str::contains("switch <id|anon>"));
}

#[test]
fn unknown_command_fails() {
    Command::cargo_bin("snoolink")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown command"));
}

#[test]
fn accounts_with_empty_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("snoolink")
        .unwrap()
        .arg("accounts")
        .env("SNOOLINK_STORAGE__DATA_DIR", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .assert()
        .success()
        .stdout(predicate::str::contains("No accounts"));
    assert!(dir.path().join("state.db").exists());
}

#[test]
fn logout_unknown_account_fails() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("snoolink")
        .unwrap()
        .args(["logout", "nope"])
        .env("SNOOLINK_STORAGE__DATA_DIR", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("no account with id nope"));
}
