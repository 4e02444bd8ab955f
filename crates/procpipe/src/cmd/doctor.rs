use std::path::{Path, PathBuf};

use procpipe::pipe::{
    DescriptorBroker, EndpointAccessor, PipeContext, ProcFsAccessor, SocketAccessor,
};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::{print_json, OutputFormat};

const PROBE: &[u8] = b"procpipe-doctor";

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    schema_id: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let mut checks = vec![procfs_check()];

    match PipeContext::new() {
        Ok(context) => {
            let identity = context.identity();
            checks.push(CheckResult::new(
                "pipe_create",
                CheckStatus::Pass,
                format!("read_fd={} write_fd={}", identity.read_fd, identity.write_fd),
            ));
            checks.push(procfs_attach_check(&context));
            checks.push(broker_check(&context));
        }
        Err(err) => {
            checks.push(CheckResult::new(
                "pipe_create",
                CheckStatus::Fail,
                err.to_string(),
            ));
        }
    }

    checks.push(compiled_features_check());

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let overall = if has_fail { "fail" } else { "pass" };

    let output = DoctorOutput {
        schema_id: "https://schemas.3leaps.dev/procpipe/cli/v1/doctor-report.schema.json",
        checks,
        overall,
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn procfs_check() -> CheckResult {
    if Path::new("/proc/self/fd").is_dir() {
        CheckResult::new("procfs_fd", CheckStatus::Pass, "/proc/self/fd available")
    } else if cfg!(target_os = "linux") {
        CheckResult::new("procfs_fd", CheckStatus::Fail, "/proc is not mounted")
    } else {
        CheckResult::new(
            "procfs_fd",
            CheckStatus::Skip,
            "no /proc on this platform; use --socket with a broker",
        )
    }
}

fn procfs_attach_check(context: &PipeContext) -> CheckResult {
    if !Path::new("/proc/self/fd").is_dir() {
        return CheckResult::new("procfs_attach", CheckStatus::Skip, "procfs unavailable");
    }

    let result = ProcFsAccessor::new()
        .write(context.identity().write_end(), PROBE)
        .and_then(|_| context.read());

    match result {
        Ok(chunk) if chunk.as_ref() == PROBE => CheckResult::new(
            "procfs_attach",
            CheckStatus::Pass,
            "write through /proc/<pid>/fd reached the pipe",
        ),
        Ok(chunk) => CheckResult::new(
            "procfs_attach",
            CheckStatus::Fail,
            format!("unexpected {} byte chunk", chunk.len()),
        ),
        Err(err) => CheckResult::new("procfs_attach", CheckStatus::Fail, err.to_string()),
    }
}

fn broker_check(context: &PipeContext) -> CheckResult {
    let dir = PathBuf::from(format!(
        "/tmp/procpipe-doctor-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    ));
    let _ = std::fs::create_dir_all(&dir);
    let sock = dir.join("doctor.sock");

    let result = DescriptorBroker::bind(&sock).and_then(|broker| {
        std::thread::scope(|s| {
            let server = s.spawn(|| broker.serve_one(context.pipe()));
            let written =
                SocketAccessor::new(&sock).write(context.identity().write_end(), PROBE);
            // A failed fetch still completes the broker's single request.
            let served = server.join().unwrap_or_else(|_| {
                Err(std::io::Error::other("broker thread panicked").into())
            });
            served.and(written)
        })?;
        context.read()
    });
    let _ = std::fs::remove_dir_all(&dir);

    match result {
        Ok(chunk) if chunk.as_ref() == PROBE => CheckResult::new(
            "broker_socket",
            CheckStatus::Pass,
            "descriptor passed over /tmp socket",
        ),
        Ok(chunk) => CheckResult::new(
            "broker_socket",
            CheckStatus::Fail,
            format!("unexpected {} byte chunk", chunk.len()),
        ),
        Err(err) => CheckResult::new("broker_socket", CheckStatus::Fail, err.to_string()),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(output),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("procpipe doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            schema_id: "x",
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn attach_and_broker_checks_pass_locally() {
        let context = PipeContext::new().expect("pipe should be created");
        assert!(matches!(
            procfs_attach_check(&context).status,
            CheckStatus::Pass | CheckStatus::Skip
        ));
        assert!(matches!(broker_check(&context).status, CheckStatus::Pass));
    }
}
