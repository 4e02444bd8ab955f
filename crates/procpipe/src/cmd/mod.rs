use clap::{Args, Subcommand};
use std::path::PathBuf;

use procpipe::pipe::{PipeConfig, DEFAULT_BUFFER_CAPACITY};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod doctor;
pub mod envinfo;
pub mod info;
pub mod inspect;
pub mod read;
pub mod serve;
pub mod version;
pub mod write;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a pipe, print its identity and print what peers write to it.
    Serve(ServeArgs),
    /// Read once from another process's pipe descriptor.
    Read(ReadArgs),
    /// Write once to another process's pipe descriptor.
    Write(WriteArgs),
    /// Show what another process's descriptor refers to.
    Inspect(InspectArgs),
    /// Print the identity of this process's shared pipe.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Read(args) => read::run(args, format),
        Command::Write(args) => write::run(args, format),
        Command::Inspect(args) => inspect::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Args, Debug, Clone, Copy)]
pub struct BufferArgs {
    /// Maximum bytes returned by one read (1 to 1048576).
    #[arg(long, env = "PROCPIPE_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_CAPACITY)]
    pub buffer_size: usize,
}

impl BufferArgs {
    pub fn config(self) -> PipeConfig {
        PipeConfig {
            buffer_capacity: self.buffer_size,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Exit after printing N chunks.
    #[arg(long, conflicts_with = "hold")]
    pub count: Option<usize>,
    /// Keep the pipe open without reading it, leaving the data to peers.
    #[arg(long)]
    pub hold: bool,
    /// Also hand out the pipe descriptors over a socket at this path.
    #[arg(long, value_name = "PATH")]
    pub broker: Option<PathBuf>,
    #[command(flatten)]
    pub buffer: BufferArgs,
}

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Process id owning the pipe (0 with --socket accepts any broker owner).
    pub pid: u32,
    /// Descriptor number of the pipe's read end in that process.
    pub fd: i32,
    /// Fetch the descriptor from a broker socket instead of /proc.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
    /// Report failures as an empty chunk instead of an error.
    #[arg(long)]
    pub lossy: bool,
    #[command(flatten)]
    pub buffer: BufferArgs,
}

#[derive(Args, Debug)]
pub struct WriteArgs {
    /// Process id owning the pipe (0 with --socket accepts any broker owner).
    pub pid: u32,
    /// Descriptor number of the pipe's write end in that process.
    pub fd: i32,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file. Without --data or --file, stdin is used.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Fetch the descriptor from a broker socket instead of /proc.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
    /// Report failures as -1 bytes written instead of an error.
    #[arg(long)]
    pub lossy: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Process id holding the descriptor.
    pub pid: u32,
    /// Descriptor number in that process.
    pub fd: i32,
}

#[derive(Args, Debug, Default)]
pub struct InfoArgs {}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}
