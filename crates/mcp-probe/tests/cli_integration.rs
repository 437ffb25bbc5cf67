#![cfg(unix)]
#![allow(deprecated)]

use assert_cmd::Command;
use predicates::str::contains;

#[test]
fn reports_server_exit_code() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{}}'; read line; exit 3"#;

    Command::cargo_bin("mcp-probe")
        .expect("binary")
        .current_dir(tmp.path())
        .args(["--deadline-ms", "5000", "--", "sh", "-c", script])
        .assert()
        .success()
        .stdout(contains("server exited on its own"))
        .stdout(contains("server exited with code 3"));
}

#[test]
fn config_file_sets_deadline() {
    let tmp = tempfile::tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("mcp-probe.toml"), "deadline_ms = 400\n").expect("write");

    Command::cargo_bin("mcp-probe")
        .expect("binary")
        .current_dir(tmp.path())
        .args(["sh", "-c", "exec sleep 30"])
        .assert()
        .success()
        .stdout(contains("terminated server after 400ms deadline"))
        .stdout(contains("server killed by signal 15"));
}

#[test]
fn missing_server_fails_with_launch_error() {
    let tmp = tempfile::tempdir().expect("tempdir");

    Command::cargo_bin("mcp-probe")
        .expect("binary")
        .current_dir(tmp.path())
        .args(["/nonexistent/mcp-server"])
        .assert()
        .failure()
        .stderr(contains("failed to launch"));
}
