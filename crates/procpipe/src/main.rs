mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "procpipe", version, about = "Cross-process anonymous pipe CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "PROCPIPE_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_write_subcommand() {
        let cli = Cli::try_parse_from(["procpipe", "write", "1234", "5", "--data", "hello"])
            .expect("write args should parse");

        assert!(matches!(cli.command, Command::Write(_)));
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "procpipe",
            "write",
            "1234",
            "5",
            "--file",
            "/tmp/payload.bin",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_read_with_socket_backend() {
        let cli = Cli::try_parse_from([
            "procpipe",
            "read",
            "0",
            "7",
            "--socket",
            "/tmp/broker.sock",
        ])
        .expect("read args should parse");
        match cli.command {
            Command::Read(args) => {
                assert_eq!(args.fd, 7);
                assert!(args.socket.is_some());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_numeric_pid() {
        let err = Cli::try_parse_from(["procpipe", "inspect", "self", "3"])
            .expect_err("pid must be numeric");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
