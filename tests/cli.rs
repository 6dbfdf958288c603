use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::tempdir;

fn valid_store_json() -> &'static str {
    r#"
{
  "version": 1,
  "next_id": 4,
  "alarms": [
    {
      "id": 1,
      "owner_id": "u1",
      "time_of_day": "07:00:00",
      "status": "active",
      "created_at": "2026-10-18T21:15:00+00:00"
    },
    {
      "id": 2,
      "owner_id": "u1",
      "time_of_day": "09:30:00",
      "status": "cancelled",
      "created_at": "2026-10-18T21:16:00+00:00"
    },
    {
      "id": 3,
      "owner_id": "u2",
      "time_of_day": "22:45:00",
      "status": "triggered",
      "created_at": "2026-10-18T21:17:00+00:00"
    }
  ]
}
"#
}

#[test]
fn diagnostics_succeeds_with_valid_store() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("alarms.json");
    fs::write(&store, valid_store_json()).expect("write json");

    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--diagnostics")
        .arg("--store")
        .arg(store)
        .assert()
        .success()
        .stdout(predicate::str::contains("Stored alarms: 3"))
        .stdout(predicate::str::contains("Active alarms: 1"))
        .stdout(predicate::str::contains("Next due: alarm 1"));
}

#[test]
fn diagnostics_treats_missing_store_as_empty() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("fresh.json");

    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--diagnostics")
        .arg("--store")
        .arg(&store)
        .assert()
        .success()
        .stdout(predicate::str::contains("Active alarms: 0"));
    assert!(!store.exists(), "diagnostics must not create the store");
}

#[test]
fn malformed_json_fails_with_clear_error() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("alarms.json");
    fs::write(&store, "{ not-valid-json ").expect("write invalid json");

    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--diagnostics")
        .arg("--store")
        .arg(store)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn duplicate_active_slot_in_store_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("alarms.json");
    let duplicated = valid_store_json()
        .replace("\"cancelled\"", "\"active\"")
        .replace("09:30:00", "07:00:00");
    fs::write(&store, duplicated).expect("write json");

    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--diagnostics")
        .arg("--store")
        .arg(store)
        .assert()
        .failure()
        .stderr(predicate::str::contains("more than one active alarm"));
}

#[test]
fn zero_fire_retries_is_rejected() {
    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--memory-store")
        .arg("--no-api")
        .arg("--fire-retry-attempts")
        .arg("0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--fire-retry-attempts"));
}

#[test]
fn voice_commands_from_stdin_are_persisted() {
    let dir = tempdir().expect("tempdir");
    let store = dir.path().join("alarms.json");

    let mut cmd = cargo_bin_cmd!("voicealarm");
    cmd.arg("--store")
        .arg(&store)
        .arg("--no-api")
        .arg("--voice-stdin")
        .arg("--owner")
        .arg("u1")
        .write_stdin("set the alarm for 7 am\nset alarm 07:00\nlist alarms\nsing a song\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("[u1] Alarm 1 set for 07:00:00"))
        .stdout(predicate::str::contains("Alarm 1 is already set for 07:00:00"))
        .stdout(predicate::str::contains("ID: 1 | Time: 07:00:00 | Status: active"))
        .stdout(predicate::str::contains("Command not recognized"));

    let saved = fs::read_to_string(&store).expect("store written");
    assert!(saved.contains("\"owner_id\": \"u1\""));
    assert!(saved.contains("\"time_of_day\": \"07:00:00\""));
}
