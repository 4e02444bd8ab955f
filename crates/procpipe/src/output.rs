use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use procpipe::pipe::{EndpointIdentity, EndpointInfo, ForeignEndpoint};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct IdentityOutput<'a> {
    schema_id: &'a str,
    pid: u32,
    read_fd: i32,
    write_fd: i32,
    read_path: String,
    write_path: String,
}

pub fn print_identity(identity: &EndpointIdentity, format: OutputFormat) {
    let read_path = identity.read_end().proc_path().display().to_string();
    let write_path = identity.write_end().proc_path().display().to_string();

    match format {
        OutputFormat::Json => {
            let out = IdentityOutput {
                schema_id: "https://schemas.3leaps.dev/procpipe/cli/v1/pipe-identity.schema.json",
                pid: identity.pid,
                read_fd: identity.read_fd,
                write_fd: identity.write_fd,
                read_path,
                write_path,
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PID", "END", "FD", "PATH"])
                .add_row(vec![
                    identity.pid.to_string(),
                    "read".to_string(),
                    identity.read_fd.to_string(),
                    read_path,
                ])
                .add_row(vec![
                    identity.pid.to_string(),
                    "write".to_string(),
                    identity.write_fd.to_string(),
                    write_path,
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!("{identity}");
        }
    }
    flush_stdout();
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    schema_id: &'a str,
    pid: u32,
    fd: i32,
    size: usize,
    payload: String,
    timestamp: String,
}

pub fn print_chunk(source: ForeignEndpoint, chunk: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ChunkOutput {
                schema_id: "https://schemas.3leaps.dev/procpipe/cli/v1/chunk-received.schema.json",
                pid: source.process_id,
                fd: source.descriptor,
                size: chunk.len(),
                payload: payload_preview(chunk),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PID", "FD", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    source.process_id.to_string(),
                    source.descriptor.to_string(),
                    chunk.len().to_string(),
                    payload_preview(chunk),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{source} size={} payload={}",
                chunk.len(),
                payload_preview(chunk)
            );
        }
        OutputFormat::Raw => print_raw(chunk),
    }
    flush_stdout();
}

#[derive(Serialize)]
struct WriteOutput<'a> {
    schema_id: &'a str,
    pid: u32,
    fd: i32,
    requested: usize,
    written: isize,
}

pub fn print_write(target: ForeignEndpoint, requested: usize, written: isize, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = WriteOutput {
                schema_id: "https://schemas.3leaps.dev/procpipe/cli/v1/write-result.schema.json",
                pid: target.process_id,
                fd: target.descriptor,
                requested,
                written,
            };
            print_json(&out);
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("{target} wrote {written} of {requested} bytes");
        }
        OutputFormat::Raw => println!("{written}"),
    }
    flush_stdout();
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    schema_id: &'a str,
    #[serde(flatten)]
    info: &'a EndpointInfo,
}

pub fn print_endpoint_info(info: &EndpointInfo, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&InspectOutput {
            schema_id: "https://schemas.3leaps.dev/procpipe/cli/v1/endpoint-info.schema.json",
            info,
        }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Endpoint:");
            println!("  Path:    {}", info.path.display());
            println!("  Target:  {}", info.link_target);
            match info.inode {
                Some(inode) => println!("  Pipe:    yes (inode {inode})"),
                None => println!("  Pipe:    no"),
            }
        }
        OutputFormat::Raw => println!("{}", info.link_target),
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Peers and test harnesses read our stdout line by line while we block.
fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_marks_binary_payloads() {
        assert_eq!(payload_preview(b"text"), "text");
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
    }

    #[test]
    fn identity_output_includes_proc_paths() {
        let out = IdentityOutput {
            schema_id: "x",
            pid: 7,
            read_fd: 3,
            write_fd: 4,
            read_path: "/proc/7/fd/3".to_string(),
            write_path: "/proc/7/fd/4".to_string(),
        };
        let json = serde_json::to_string(&out).expect("identity should serialize");
        assert!(json.contains("\"write_path\":\"/proc/7/fd/4\""));
    }
}
