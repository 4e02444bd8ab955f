//! Attaching to pipe endpoints held by other processes.
//!
//! An [`EndpointAccessor`] turns a [`ForeignEndpoint`] (pid plus descriptor
//! number) into a transient local descriptor. Every `read`/`write` opens a
//! descriptor, performs exactly one OS call and closes it again before
//! returning; nothing is cached between calls.
//!
//! [`ProcFsAccessor`] opens `/proc/<pid>/fd/<fd>` and needs Linux procfs.
//! [`SocketAccessor`](crate::broker::SocketAccessor) asks a
//! [`DescriptorBroker`](crate::broker::DescriptorBroker) for the descriptor
//! instead and works wherever Unix domain sockets do.

use std::fs::OpenOptions;
use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::endpoint::{AccessMode, ForeignEndpoint};
use crate::error::{PipeError, Result};
use crate::pipe::{read_chunk, write_once, PipeConfig};

/// Returned by [`write_or_sentinel`] when the write could not be performed.
pub const WRITE_FAILED: isize = -1;

/// Opens descriptors aliasing another process's pipe endpoint.
pub trait EndpointAccessor {
    /// Open a fresh descriptor for `target` in the given direction.
    fn open(&self, target: ForeignEndpoint, mode: AccessMode) -> Result<OwnedFd>;

    /// Maximum bytes returned by one [`read`](Self::read).
    fn buffer_capacity(&self) -> usize {
        PipeConfig::default().buffer_capacity
    }

    /// Open read-only, read once, close.
    fn read(&self, target: ForeignEndpoint) -> Result<Bytes> {
        let fd = self.open(target, AccessMode::Read)?;
        let chunk = read_chunk(fd.as_fd(), self.buffer_capacity())?;
        debug!(%target, size = chunk.len(), "read from foreign endpoint");
        Ok(chunk)
    }

    /// Open write-only, write once, close. May write fewer bytes than `data`.
    fn write(&self, target: ForeignEndpoint, data: &[u8]) -> Result<usize> {
        let fd = self.open(target, AccessMode::Write)?;
        let written = write_once(fd.as_fd(), data)?;
        debug!(%target, written, "wrote to foreign endpoint");
        Ok(written)
    }
}

/// Attaches through the `/proc/<pid>/fd/<fd>` pseudo-filesystem.
#[derive(Clone, Debug, Default)]
pub struct ProcFsAccessor {
    config: PipeConfig,
}

impl ProcFsAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PipeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl EndpointAccessor for ProcFsAccessor {
    fn open(&self, target: ForeignEndpoint, mode: AccessMode) -> Result<OwnedFd> {
        let path = target.proc_path();
        let mut options = OpenOptions::new();
        match mode {
            AccessMode::Read => options.read(true),
            AccessMode::Write => options.write(true),
        };

        let file = options
            .open(&path)
            .map_err(|source| PipeError::AttachFailure {
                path: path.clone(),
                source,
            })?;
        debug!(?path, mode = mode.as_str(), "opened foreign endpoint");
        Ok(OwnedFd::from(file))
    }

    fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }
}

/// Read once from `/proc/<process_id>/fd/<descriptor>`.
///
/// Never fails: an attach or read error is logged as a warning and an empty
/// chunk is returned, so empty does not imply "no data".
pub fn read_or_empty(process_id: u32, descriptor: RawFd) -> Bytes {
    read_or_empty_with(&ProcFsAccessor::new(), ForeignEndpoint::new(process_id, descriptor))
}

/// Write once to `/proc/<process_id>/fd/<descriptor>`.
///
/// Returns bytes written, or [`WRITE_FAILED`] after logging a warning.
pub fn write_or_sentinel(process_id: u32, descriptor: RawFd, data: &[u8]) -> isize {
    write_or_sentinel_with(
        &ProcFsAccessor::new(),
        ForeignEndpoint::new(process_id, descriptor),
        data,
    )
}

pub fn read_or_empty_with<A>(accessor: &A, target: ForeignEndpoint) -> Bytes
where
    A: EndpointAccessor + ?Sized,
{
    match accessor.read(target) {
        Ok(chunk) => chunk,
        Err(err) => {
            warn!(
                pid = target.process_id,
                fd = target.descriptor,
                error = %err,
                "cross-process read failed"
            );
            Bytes::new()
        }
    }
}

pub fn write_or_sentinel_with<A>(accessor: &A, target: ForeignEndpoint, data: &[u8]) -> isize
where
    A: EndpointAccessor + ?Sized,
{
    match accessor.write(target, data) {
        Ok(written) => isize::try_from(written).unwrap_or(isize::MAX),
        Err(err) => {
            warn!(
                pid = target.process_id,
                fd = target.descriptor,
                error = %err,
                "cross-process write failed"
            );
            WRITE_FAILED
        }
    }
}

/// A foreign endpoint opened once and kept open for repeated I/O.
///
/// The one-shot [`EndpointAccessor`] calls pay an open and a close per
/// operation. A peer that writes many chunks attaches once instead and
/// holds the descriptor until the handle is dropped. Each `read`/`write`
/// is still exactly one OS call.
#[derive(Debug)]
pub struct AttachedEndpoint {
    fd: OwnedFd,
    target: ForeignEndpoint,
    mode: AccessMode,
    buffer_capacity: usize,
}

impl AttachedEndpoint {
    /// Open `target` through `accessor` and keep the descriptor.
    pub fn open<A>(accessor: &A, target: ForeignEndpoint, mode: AccessMode) -> Result<Self>
    where
        A: EndpointAccessor + ?Sized,
    {
        let fd = accessor.open(target, mode)?;
        debug!(%target, mode = mode.as_str(), local_fd = fd.as_raw_fd(), "attached endpoint");
        Ok(Self {
            fd,
            target,
            mode,
            buffer_capacity: accessor.buffer_capacity(),
        })
    }

    /// Attach to the write end `descriptor` of `process_id` through `/proc`.
    pub fn writer(process_id: u32, descriptor: RawFd) -> Result<Self> {
        Self::open(
            &ProcFsAccessor::new(),
            ForeignEndpoint::new(process_id, descriptor),
            AccessMode::Write,
        )
    }

    /// Attach to the read end `descriptor` of `process_id` through `/proc`.
    pub fn reader(process_id: u32, descriptor: RawFd) -> Result<Self> {
        Self::open(
            &ProcFsAccessor::new(),
            ForeignEndpoint::new(process_id, descriptor),
            AccessMode::Read,
        )
    }

    pub fn target(&self) -> ForeignEndpoint {
        self.target
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// The local descriptor aliasing the foreign endpoint.
    pub fn local_descriptor(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// One bounded read. An empty chunk means end of stream.
    pub fn read(&self) -> Result<Bytes> {
        self.require(AccessMode::Read)?;
        Ok(read_chunk(self.fd.as_fd(), self.buffer_capacity)?)
    }

    /// One write; the count may be shorter than `data`.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.require(AccessMode::Write)?;
        Ok(write_once(self.fd.as_fd(), data)?)
    }

    fn require(&self, mode: AccessMode) -> Result<()> {
        if self.mode == mode {
            return Ok(());
        }
        Err(PipeError::Io(io::Error::new(
            ErrorKind::PermissionDenied,
            format!(
                "endpoint {} is attached for {}, not {}",
                self.target,
                self.mode.as_str(),
                mode.as_str()
            ),
        )))
    }
}

/// What a foreign descriptor currently refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub path: PathBuf,
    pub link_target: String,
    pub is_pipe: bool,
    pub inode: Option<u64>,
}

/// Resolve the `/proc` link of a foreign descriptor without opening it.
pub fn inspect(target: ForeignEndpoint) -> Result<EndpointInfo> {
    let path = target.proc_path();
    let link = std::fs::read_link(&path).map_err(|source| PipeError::AttachFailure {
        path: path.clone(),
        source,
    })?;
    let link_target = link.to_string_lossy().into_owned();
    let inode = parse_pipe_inode(&link_target);

    Ok(EndpointInfo {
        path,
        is_pipe: inode.is_some(),
        inode,
        link_target,
    })
}

/// Extract the inode from a `pipe:[<inode>]` link target.
fn parse_pipe_inode(link_target: &str) -> Option<u64> {
    link_target
        .strip_prefix("pipe:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
