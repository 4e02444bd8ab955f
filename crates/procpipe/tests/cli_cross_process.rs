#![cfg(all(target_os = "linux", feature = "cli"))]

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Output, Stdio};

use serde_json::Value;

/// A `procpipe serve` child whose identity line has already been read.
struct ServeChild {
    child: Child,
    stdout: BufReader<ChildStdout>,
    pid: u64,
    read_fd: i64,
    write_fd: i64,
}

impl ServeChild {
    fn spawn(extra: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_procpipe"))
            .args(["--log-level", "error", "--format", "json", "serve"])
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("serve command should start");

        let mut stdout = BufReader::new(child.stdout.take().expect("stdout should be piped"));
        let identity = next_json(&mut stdout);

        Self {
            pid: identity["pid"].as_u64().expect("identity should carry pid"),
            read_fd: identity["read_fd"].as_i64().expect("identity should carry read_fd"),
            write_fd: identity["write_fd"].as_i64().expect("identity should carry write_fd"),
            child,
            stdout,
        }
    }
}

impl Drop for ServeChild {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn next_json(reader: &mut impl BufRead) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("child stdout should be readable");
    serde_json::from_str(&line).unwrap_or_else(|err| panic!("bad json line {line:?}: {err}"))
}

fn procpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_procpipe"))
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("procpipe should run")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be json")
}

fn missing_pid() -> String {
    std::fs::read_to_string("/proc/sys/kernel/pid_max")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "4194304".to_string())
}

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/procpipe-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

#[test]
fn peer_write_is_printed_by_serving_process() {
    let mut serve = ServeChild::spawn(&["--count", "1"]);
    assert_ne!(serve.read_fd, serve.write_fd);

    let output = procpipe(&[
        "write",
        &serve.pid.to_string(),
        &serve.write_fd.to_string(),
        "--data",
        "hello",
    ]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["written"], 5);

    let chunk = next_json(&mut serve.stdout);
    assert_eq!(chunk["payload"], "hello");
    assert_eq!(chunk["size"], 5);

    let status = serve.child.wait().expect("serve should exit");
    assert!(status.success());
}

#[test]
fn held_pipe_concatenates_peer_writes() {
    let serve = ServeChild::spawn(&["--hold"]);
    let pid = serve.pid.to_string();

    for part in ["hello", "world"] {
        let output = procpipe(&["write", &pid, &serve.write_fd.to_string(), "--data", part]);
        assert!(output.status.success());
    }

    let output = procpipe(&["read", &pid, &serve.read_fd.to_string()]);
    assert!(output.status.success());
    let chunk = stdout_json(&output);
    assert_eq!(chunk["payload"], "helloworld");
    assert!(String::from_utf8_lossy(&output.stdout).contains("chunk-received.schema.json"));
}

#[test]
fn broker_socket_serves_descriptors() {
    let dir = unique_temp_dir("broker");
    let sock = dir.join("broker.sock");
    let sock_arg = sock.to_str().expect("socket path should be utf-8");
    let serve = ServeChild::spawn(&["--hold", "--broker", sock_arg]);

    let output = procpipe(&[
        "write",
        "0",
        &serve.write_fd.to_string(),
        "--socket",
        sock_arg,
        "--data",
        "brokered",
    ]);
    assert!(output.status.success());

    let output = procpipe(&[
        "read",
        &serve.pid.to_string(),
        &serve.read_fd.to_string(),
        "--socket",
        sock_arg,
    ]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["payload"], "brokered");

    drop(serve);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn inspect_reports_pipe_of_serving_process() {
    let serve = ServeChild::spawn(&["--hold"]);
    let output = procpipe(&["inspect", &serve.pid.to_string(), &serve.read_fd.to_string()]);
    assert!(output.status.success());
    let info = stdout_json(&output);
    assert_eq!(info["is_pipe"], true);
    assert!(info["link_target"]
        .as_str()
        .map(|s| s.starts_with("pipe:["))
        .unwrap_or(false));
}

#[test]
fn read_from_missing_process_fails() {
    let output = procpipe(&["read", &missing_pid(), "3"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot attach"));
}

#[test]
fn oversized_buffer_size_is_rejected() {
    let pid = std::process::id().to_string();
    for args in [
        vec!["read", pid.as_str(), "3", "--buffer-size", "100000000000000"],
        vec!["read", pid.as_str(), "3", "--lossy", "--buffer-size", "100000000000000"],
    ] {
        let output = procpipe(&args);
        assert_eq!(output.status.code(), Some(64));
        assert!(String::from_utf8_lossy(&output.stderr).contains("exceeds maximum"));
    }

    let output = Command::new(env!("CARGO_BIN_EXE_procpipe"))
        .args(["serve", "--count", "1"])
        .env("PROCPIPE_BUFFER_SIZE", "2097152")
        .stdin(Stdio::null())
        .output()
        .expect("procpipe should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn lossy_commands_report_sentinels() {
    let pid = missing_pid();

    let output = procpipe(&["read", &pid, "3", "--lossy"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["size"], 0);

    let output = procpipe(&["write", &pid, "4", "--data", "x", "--lossy"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["written"], -1);
}

#[test]
fn info_prints_identity() {
    let output = procpipe(&["info"]);
    assert!(output.status.success());
    let identity = stdout_json(&output);
    assert!(identity["read_path"]
        .as_str()
        .map(|s| s.starts_with("/proc/"))
        .unwrap_or(false));
}

#[test]
fn doctor_passes_on_clean_env() {
    let output = procpipe(&["doctor"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("doctor-report.schema.json"));
}

#[test]
fn envinfo_reports_version() {
    let output = procpipe(&["envinfo"]);
    assert!(output.status.success());
    let payload = stdout_json(&output);
    assert_eq!(
        payload.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
}
