#![allow(missing_docs)]

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

fn stdout_of(args: &[&str]) -> String {
    let output = cargo_bin_cmd!("dirstore")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    String::from_utf8(output).expect("utf-8 stdout")
}

fn stderr_of_failure(args: &[&str]) -> String {
    let output = cargo_bin_cmd!("dirstore")
        .args(args)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    String::from_utf8(output).expect("utf-8 stderr")
}

#[test]
fn vlv_key_encodings() {
    assert_eq!(stdout_of(&["vlv-key", "6162"]).trim(), "00616200");
    assert_eq!(stdout_of(&["vlv-key", "0001"]).trim(), "000101010200");
    assert_eq!(stdout_of(&["vlv-key", "--descending", "6162"]).trim(), "ff9e9dff");
    assert_eq!(stdout_of(&["vlv-key", "--null"]).trim(), "ff");
    assert_eq!(stdout_of(&["vlv-key", "--null", "--descending"]).trim(), "00");
}

#[test]
fn vlv_key_rejects_bad_input() {
    let stderr = stderr_of_failure(&["vlv-key", "zz"]);
    assert!(stderr.starts_with("error:"), "{stderr}");
    stderr_of_failure(&["vlv-key"]);
}

#[test]
fn idset_decodes_defined_and_undefined_values() {
    let defined = stdout_of(&["idset", "00000000000000010000000000000003"]);
    assert!(defined.contains("defined: true"), "{defined}");
    assert!(defined.contains("size: 2"), "{defined}");
    assert!(defined.contains("ids: [1,3]"), "{defined}");

    let limited = stdout_of(&["idset", "--key", "ab", "8000000000000005"]);
    assert!(limited.contains("defined: false"), "{limited}");
    assert!(limited.contains("[LIMIT-EXCEEDED:6162] COUNT: 5"), "{limited}");

    let unknown = stdout_of(&["idset", "ffffffffffffffff"]);
    assert!(unknown.contains("[NOT-INDEXED]"), "{unknown}");
}

#[test]
fn idset_reports_corruption() {
    let stderr = stderr_of_failure(&["idset", "00000000000000020000000000000001"]);
    assert!(stderr.contains("corruption"), "{stderr}");
    let stderr = stderr_of_failure(&["idset", "800000000000000500"]);
    assert!(stderr.contains("corruption"), "{stderr}");
}

#[test]
fn lock_stress_runs_with_config_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("backend.toml");
    fs::write(
        &config,
        "lock_timeout_ms = 50\nlock_cache_capacity = 4\nlock_table_shards = 4\n",
    )
    .expect("write config");
    let stdout = stdout_of(&[
        "--config",
        config.to_str().expect("utf-8 path"),
        "--log",
        "dirstore=warn",
        "lock-stress",
        "--threads",
        "4",
        "--ops",
        "500",
        "--fanout",
        "3",
        "--seed",
        "42",
    ]);
    assert!(stdout.contains("threads=4"), "{stdout}");
    assert!(stdout.contains("residual=0"), "{stdout}");
}

#[test]
fn invalid_configuration_is_reported() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("backend.toml");
    fs::write(&config, "lock_timeout_seconds = 5\n").expect("write config");
    let stderr = stderr_of_failure(&[
        "--config",
        config.to_str().expect("utf-8 path"),
        "lock-stress",
        "--ops",
        "1",
    ]);
    assert!(stderr.contains("configuration"), "{stderr}");

    let stderr = stderr_of_failure(&["--log", "dirstore=loudest", "vlv-key", "--null"]);
    assert!(stderr.contains("invalid log filter"), "{stderr}");
}
