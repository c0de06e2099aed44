use serde_json::Value;
use std::process::{Command, Output};

fn cli() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_obx-bridge-cli"));
    command
        .env_remove("OBX_BRIDGE_PORT_QUEUE_CAPACITY")
        .env_remove("OBX_BRIDGE_MAX_FINALIZERS")
        .env_remove("OBX_BRIDGE_STREAM_THREAD_NAME")
        .env_remove("OBX_BRIDGE_STREAM_TERMINAL_TIMEOUT_MS")
        .env("OBX_BRIDGE_LOG", "off");
    command
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8(output.stdout.clone())
        .expect("stdout should be utf-8")
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn observe_prints_changes_for_filtered_type() {
    let output = cli()
        .args(["observe", "--commit", "1,2", "--commit", "3", "--type-id", "2"])
        .output()
        .expect("cli should run");
    assert!(output.status.success(), "{output:?}");
    let lines = stdout_lines(&output);
    assert_eq!(lines[0], "changed types: 2");
    assert!(lines[1].contains("accepted=1"), "{lines:?}");
}

#[test]
fn stream_json_output_ends_with_terminal() {
    let output = cli()
        .args(["--json", "stream", "--row", "a", "--row", "b", "--row", "c"])
        .output()
        .expect("cli should run");
    assert!(output.status.success(), "{output:?}");
    let messages: Vec<Value> = stdout_lines(&output)
        .iter()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["type"], "bytes");
    assert_eq!(messages[3], serde_json::json!({"type": "null"}));
}

#[test]
fn failing_stream_exits_with_code_two() {
    let output = cli()
        .args(["stream", "--row", "a", "--fail-after", "1", "--fail-code", "404"])
        .output()
        .expect("cli should run");
    assert_eq!(output.status.code(), Some(2));
    let lines = stdout_lines(&output);
    assert_eq!(
        lines,
        vec![
            "row: a".to_string(),
            "error 404: engine error 404: query failed".to_string(),
            "end".to_string(),
        ]
    );
}

#[test]
fn failing_stream_logs_a_warning_when_enabled() {
    let output = cli()
        .env("OBX_BRIDGE_LOG", "warn")
        .args(["stream", "--row", "a", "--fail-after", "0"])
        .output()
        .expect("cli should run");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("query stream reported an error"), "{stderr}");
}

#[test]
fn update_of_missing_object_reports_not_found() {
    let output = cli()
        .args(["put", "--object", "x", "--id", "9", "--mode", "update"])
        .output()
        .expect("cli should run");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(stdout_lines(&output), vec!["put 9: error 404".to_string()]);
}

#[test]
fn sync_prints_one_line_per_event() {
    let output = cli()
        .args(["sync", "--event", "connect", "--event", "login-failure"])
        .output()
        .expect("cli should run");
    assert!(output.status.success(), "{output:?}");
    assert_eq!(
        stdout_lines(&output),
        vec!["connect: Null".to_string(), "login_failure: Int(43)".to_string()]
    );
}

#[test]
fn config_file_and_environment_are_merged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    std::fs::write(&path, r#"{"max_finalizers": 3, "port_queue_capacity": 16}"#)
        .expect("config write should succeed");

    let output = cli()
        .env("OBX_BRIDGE_PORT_QUEUE_CAPACITY", "32")
        .arg("--config")
        .arg(&path)
        .arg("show-config")
        .output()
        .expect("cli should run");
    assert!(output.status.success(), "{output:?}");
    let config: Value = serde_json::from_slice(&output.stdout).expect("config json");
    assert_eq!(config["max_finalizers"], 3);
    assert_eq!(config["port_queue_capacity"], 32);
    assert_eq!(config["stream_thread_name"], "obx-query-stream");
}

#[test]
fn missing_config_file_fails_with_exit_code_one() {
    let output = cli()
        .args(["--config", "/nonexistent/bridge.json", "show-config"])
        .output()
        .expect("cli should run");
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to read config file"), "{stderr}");
}
