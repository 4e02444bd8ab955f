use std::fmt;
use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::endpoint::EndpointIdentity;
use crate::error::{PipeError, Result};

/// Default maximum number of bytes returned by a single read.
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Largest accepted read capacity (1 MiB, the default Linux `pipe-max-size`).
///
/// Every read allocates a buffer of the configured capacity up front.
pub const MAX_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Pipe configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipeConfig {
    /// Upper bound on the size of one [`ByteChunk`](bytes::Bytes) returned by `read`.
    pub buffer_capacity: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(PipeError::InvalidConfig(
                "buffer capacity must be greater than zero".to_string(),
            ));
        }
        if self.buffer_capacity > MAX_BUFFER_CAPACITY {
            return Err(PipeError::InvalidConfig(format!(
                "buffer capacity {} exceeds maximum of {MAX_BUFFER_CAPACITY} bytes",
                self.buffer_capacity
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a [`PipeCore`]. There is no way back from `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeState {
    Uninitialized,
    Created,
    Closed,
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipeState::Uninitialized => "uninitialized",
            PipeState::Created => "created",
            PipeState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Both ends of one OS pipe plus the process that created it.
#[derive(Debug)]
pub struct PipeEndpoint {
    read: OwnedFd,
    write: OwnedFd,
    owning_process_id: u32,
}

impl PipeEndpoint {
    pub fn read_descriptor(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_descriptor(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    pub fn owning_process_id(&self) -> u32 {
        self.owning_process_id
    }

    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    pub fn write_fd(&self) -> BorrowedFd<'_> {
        self.write.as_fd()
    }

    pub fn identity(&self) -> EndpointIdentity {
        EndpointIdentity {
            pid: self.owning_process_id,
            read_fd: self.read_descriptor(),
            write_fd: self.write_descriptor(),
        }
    }
}

#[derive(Debug)]
enum Slot {
    Uninitialized,
    Created(PipeEndpoint),
    Closed,
}

/// Owns one anonymous pipe and performs blocking local reads and writes.
///
/// Every read allocates its own buffer (or uses one supplied by the
/// caller), so `read` and `write` take `&self` and an instance can be
/// shared between threads. Each call maps to exactly one OS read or write.
#[derive(Debug)]
pub struct PipeCore {
    slot: Slot,
    config: PipeConfig,
}

impl Default for PipeCore {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeCore {
    /// An uninitialized pipe with default configuration. Call [`init`](Self::init) before use.
    pub fn new() -> Self {
        Self {
            slot: Slot::Uninitialized,
            config: PipeConfig::default(),
        }
    }

    pub fn with_config(config: PipeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slot: Slot::Uninitialized,
            config,
        })
    }

    /// Create and initialize a pipe in one step.
    pub fn open(config: PipeConfig) -> Result<Self> {
        let mut pipe = Self::with_config(config)?;
        pipe.init()?;
        Ok(pipe)
    }

    /// Request a new OS pipe, returning `(read, write)` ends.
    pub fn create() -> Result<(OwnedFd, OwnedFd)> {
        let mut fds: [RawFd; 2] = [-1, -1];

        // SAFETY: `fds` is a writable array of two descriptors as pipe2(2) requires.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        // SAFETY: same contract as above; close-on-exec is applied below.
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EMFILE) | Some(libc::ENFILE) => PipeError::ResourceExhausted(err),
                _ => PipeError::Io(err),
            });
        }

        // SAFETY: pipe creation succeeded, so both descriptors are open and
        // not owned by anything else in this process.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            set_cloexec(read.as_fd())?;
            set_cloexec(write.as_fd())?;
        }

        debug!(read_fd = fds[0], write_fd = fds[1], "created pipe");
        Ok((read, write))
    }

    /// Allocate the OS pipe and record the current process as its owner.
    pub fn init(&mut self) -> Result<()> {
        if self.state() != PipeState::Uninitialized {
            return Err(PipeError::PreconditionViolation {
                operation: "init",
                state: self.state(),
            });
        }

        let (read, write) = Self::create()?;
        self.slot = Slot::Created(PipeEndpoint {
            read,
            write,
            owning_process_id: std::process::id(),
        });
        Ok(())
    }

    pub fn state(&self) -> PipeState {
        match self.slot {
            Slot::Uninitialized => PipeState::Uninitialized,
            Slot::Created(_) => PipeState::Created,
            Slot::Closed => PipeState::Closed,
        }
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// The live endpoint, or `PreconditionViolation` naming `operation`.
    fn require(&self, operation: &'static str) -> Result<&PipeEndpoint> {
        match &self.slot {
            Slot::Created(endpoint) => Ok(endpoint),
            _ => Err(PipeError::PreconditionViolation {
                operation,
                state: self.state(),
            }),
        }
    }

    pub fn endpoint(&self) -> Result<&PipeEndpoint> {
        self.require("access endpoint")
    }

    pub fn identity(&self) -> Result<EndpointIdentity> {
        self.endpoint().map(PipeEndpoint::identity)
    }

    /// Owning process id, once created.
    pub fn pid(&self) -> Option<u32> {
        self.endpoint().ok().map(PipeEndpoint::owning_process_id)
    }

    pub fn read_descriptor(&self) -> Option<RawFd> {
        self.endpoint().ok().map(PipeEndpoint::read_descriptor)
    }

    pub fn write_descriptor(&self) -> Option<RawFd> {
        self.endpoint().ok().map(PipeEndpoint::write_descriptor)
    }

    /// Read whatever one OS read returns, up to the configured capacity.
    ///
    /// Blocks while the pipe is empty and a writer exists. An empty chunk
    /// means end of stream.
    pub fn read(&self) -> Result<Bytes> {
        let endpoint = self.require("read")?;
        Ok(read_chunk(endpoint.read_fd(), self.config.buffer_capacity)?)
    }

    /// Like [`read`](Self::read) but into a caller-supplied buffer.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        let endpoint = self.require("read")?;
        Ok(read_once(endpoint.read_fd(), buf)?)
    }

    /// One OS write. The returned count may be shorter than `data`;
    /// callers resubmit the remainder themselves.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let endpoint = self.require("write")?;
        Ok(write_once(endpoint.write_fd(), data)?)
    }

    /// Release both descriptors. Closing twice is a no-op.
    pub fn close(&mut self) {
        if let Slot::Created(endpoint) = std::mem::replace(&mut self.slot, Slot::Closed) {
            debug!(
                read_fd = endpoint.read_descriptor(),
                write_fd = endpoint.write_descriptor(),
                "closing pipe"
            );
            drop(endpoint);
        }
    }
}

/// One `read(2)` into `buf`, retried only on `EINTR`.
pub(crate) fn read_once(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes and `fd` is
        // borrowed from a live owner for the duration of the call.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One bounded read into a fresh buffer.
pub(crate) fn read_chunk(fd: BorrowedFd<'_>, capacity: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(capacity);
    let n = read_once(fd, &mut buf)?;
    buf.truncate(n);
    Ok(buf.freeze())
}

/// One `write(2)` of `data`, retried only on `EINTR`.
pub(crate) fn write_once(fd: BorrowedFd<'_>, data: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `data` is valid for `data.len()` readable bytes and `fd` is
        // borrowed from a live owner for the duration of the call.
        let n = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: fcntl on a borrowed, open descriptor.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn created() -> PipeCore {
        let mut pipe = PipeCore::new();
        pipe.init().expect("pipe should be created");
        pipe
    }

    fn set_nonblocking(fd: RawFd) {
        // SAFETY: test-only fcntl calls on a descriptor owned by the pipe under test.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            assert!(flags >= 0);
            assert_eq!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
        }
    }

    #[test]
    fn init_records_owner_and_distinct_descriptors() {
        let pipe = created();
        assert_eq!(pipe.state(), PipeState::Created);
        assert_eq!(pipe.pid(), Some(std::process::id()));

        let read_fd = pipe.read_descriptor().unwrap();
        let write_fd = pipe.write_descriptor().unwrap();
        assert_ne!(read_fd, write_fd);
        assert!(read_fd > 0 && write_fd > 0);
    }

    #[test]
    fn round_trip_single_read() {
        let pipe = created();
        let payload = b"the quick brown fox";
        assert_eq!(pipe.write(payload).unwrap(), payload.len());
        assert_eq!(pipe.read().unwrap().as_ref(), payload);
    }

    #[test]
    fn writes_are_not_framed() {
        let pipe = created();
        pipe.write(b"hello").unwrap();
        pipe.write(b"world").unwrap();
        assert_eq!(pipe.read().unwrap().as_ref(), b"helloworld");
    }

    #[test]
    fn read_is_capped_at_buffer_capacity() {
        let pipe = PipeCore::open(PipeConfig { buffer_capacity: 4 }).unwrap();
        pipe.write(b"abcdefgh").unwrap();
        assert_eq!(pipe.read().unwrap().as_ref(), b"abcd");
        assert_eq!(pipe.read().unwrap().as_ref(), b"efgh");
    }

    #[test]
    fn read_into_caller_buffer() {
        let pipe = created();
        pipe.write(b"xyz").unwrap();
        let mut buf = [0u8; 16];
        let n = pipe.read_into(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyz");
    }

    #[test]
    fn oversized_write_may_be_short() {
        let pipe = created();
        set_nonblocking(pipe.write_descriptor().unwrap());

        let payload = vec![0x5A; 4 * 1024 * 1024];
        let written = pipe.write(&payload).unwrap();
        assert!(written > 0);
        assert!(written < payload.len());
    }

    #[test]
    fn read_blocks_until_data_arrives() {
        let pipe = Arc::new(created());
        let (tx, rx) = mpsc::channel();

        let reader = {
            let pipe = Arc::clone(&pipe);
            thread::spawn(move || {
                let chunk = pipe.read().expect("read should succeed");
                tx.send(chunk).expect("receiver should be alive");
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        pipe.write(b"late").unwrap();
        let chunk = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reader should wake after write");
        assert_eq!(chunk.as_ref(), b"late");
        reader.join().unwrap();
    }

    #[test]
    fn read_returns_empty_once_writer_closes() {
        let (read, write) = PipeCore::create().unwrap();
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn(move || {
            let chunk = read_chunk(read.as_fd(), DEFAULT_BUFFER_CAPACITY).unwrap();
            tx.send(chunk).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        drop(write);
        let chunk = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reader should observe EOF");
        assert!(chunk.is_empty());
        reader.join().unwrap();
    }

    #[test]
    fn uninitialized_pipe_rejects_io() {
        let pipe = PipeCore::new();
        let err = pipe.read().unwrap_err();
        assert!(matches!(
            err,
            PipeError::PreconditionViolation {
                operation: "read",
                state: PipeState::Uninitialized
            }
        ));
        assert!(matches!(
            pipe.write(b"x"),
            Err(PipeError::PreconditionViolation { operation: "write", .. })
        ));
        assert_eq!(pipe.pid(), None);
        assert_eq!(pipe.read_descriptor(), None);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let mut pipe = created();
        pipe.close();
        pipe.close();
        assert_eq!(pipe.state(), PipeState::Closed);
        assert!(matches!(
            pipe.init(),
            Err(PipeError::PreconditionViolation {
                operation: "init",
                state: PipeState::Closed
            })
        ));
        assert!(pipe.read().is_err());
    }

    #[test]
    fn double_init_is_rejected() {
        let mut pipe = created();
        assert!(matches!(
            pipe.init(),
            Err(PipeError::PreconditionViolation { operation: "init", .. })
        ));
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let err = PipeCore::with_config(PipeConfig { buffer_capacity: 0 }).unwrap_err();
        assert!(matches!(err, PipeError::InvalidConfig(_)));
    }

    #[test]
    fn oversized_capacity_is_invalid() {
        for capacity in [MAX_BUFFER_CAPACITY + 1, usize::MAX] {
            let err = PipeCore::open(PipeConfig {
                buffer_capacity: capacity,
            })
            .unwrap_err();
            assert!(matches!(err, PipeError::InvalidConfig(_)));
        }

        let pipe = PipeCore::open(PipeConfig {
            buffer_capacity: MAX_BUFFER_CAPACITY,
        })
        .unwrap();
        pipe.write(b"max").unwrap();
        assert_eq!(pipe.read().unwrap().as_ref(), b"max");
    }
}
