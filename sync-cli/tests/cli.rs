//! End-to-end tests for the convo-sync binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn convo_sync() -> Command {
    Command::cargo_bin("convo-sync").unwrap()
}

#[test]
fn config_prints_defaults() {
    convo_sync()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"send_timeout_ms\": 10000"));
}

#[test]
fn invalid_config_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "page_size = 0").unwrap();

    convo_sync()
        .arg("--config")
        .arg(file.path())
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("page_size"));
}

#[test]
fn replay_prints_snapshot() {
    let mut script = tempfile::NamedTempFile::new().unwrap();
    write!(
        script,
        r#"{{
            "conversation": {{ "id": 4, "participants": [1, 2] }},
            "local_user": 1,
            "history": [{{ "id": 1, "senderId": 2, "content": "hello", "createdAt": 10 }}],
            "steps": [
                {{ "step": "send", "text": "hi back", "wait": true }},
                {{ "step": "mark_read" }}
            ]
        }}"#
    )
    .unwrap();

    convo_sync()
        .arg("replay")
        .arg(script.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\":\"ready\""))
        .stdout(predicate::str::contains("hi back"))
        .stdout(predicate::str::contains("\"unread\":0"));
}

#[test]
fn replay_rejects_malformed_script() {
    let mut script = tempfile::NamedTempFile::new().unwrap();
    write!(script, "{{ \"local_user\": 1 }}").unwrap();

    convo_sync()
        .arg("replay")
        .arg(script.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid replay script"));
}
