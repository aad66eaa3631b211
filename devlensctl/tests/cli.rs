use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[test]
fn help_lists_the_four_commands() {
    Command::cargo_bin("devlensctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("start")
                .and(predicate::str::contains("status"))
                .and(predicate::str::contains("export-events"))
                .and(predicate::str::contains("replay")),
        );
}

#[test]
fn bad_config_exits_with_code_two() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"this is { not toml").unwrap();
    Command::cargo_bin("devlensctl")
        .unwrap()
        .args(["--config"])
        .arg(file.path())
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn export_events_on_a_fresh_store_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("devlens.toml");
    std::fs::write(
        &config_path,
        format!(
            "[storage]\npath = {:?}\n",
            dir.path().join("devlens.db").to_string_lossy()
        ),
    )
    .unwrap();

    Command::cargo_bin("devlensctl")
        .unwrap()
        .args(["--config"])
        .arg(&config_path)
        .arg("export-events")
        .assert()
        .success()
        .stderr(predicate::str::contains("exported 0 events"));
}
