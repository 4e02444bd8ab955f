use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::accessor::EndpointAccessor;
use crate::endpoint::{AccessMode, ForeignEndpoint};
use crate::error::{PipeError, Result};
use crate::pipe::{PipeConfig, PipeCore};

const STATUS_OK: u8 = 0;
const STATUS_REFUSED: u8 = 1;
/// Status byte followed by the owner pid (u32 LE).
const REPLY_LEN: usize = 5;

/// Result of one brokered request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerOutcome {
    Served { descriptor: RawFd },
    Refused { descriptor: RawFd },
}

/// Hands out duplicates of a pipe's descriptors over a Unix domain socket.
///
/// A peer connects, sends the descriptor number it wants as a little-endian
/// `u32`, and receives the descriptor itself via `SCM_RIGHTS`. Only the two
/// descriptors of the served [`PipeCore`] are ever passed. This is the
/// fallback for systems where `/proc/<pid>/fd` is unavailable.
pub struct DescriptorBroker {
    listener: UnixListener,
    path: PathBuf,
    /// `(dev, ino)` of the socket file this broker created.
    created_inode: (u64, u64),
}

impl DescriptorBroker {
    /// Default permission mode for created socket paths.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind the broker socket at `path`, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind the broker socket with an explicit permission mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(PipeError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_error = |source: io::Error| PipeError::Bind {
            path: path.clone(),
            source,
        };

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_error)?;
            if !metadata.file_type().is_socket() {
                return Err(bind_error(io::Error::new(
                    ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale broker socket");
            std::fs::remove_file(&path).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_error)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_error)?;

        info!(?path, "descriptor broker listening");

        Ok(Self {
            listener,
            created_inode: (created.dev(), created.ino()),
            path,
        })
    }

    /// Accept one connection and answer its descriptor request from `pipe`.
    pub fn serve_one(&self, pipe: &PipeCore) -> Result<BrokerOutcome> {
        let endpoint = pipe.endpoint()?;
        let (mut stream, _addr) = self.listener.accept()?;

        let mut request = [0u8; 4];
        stream.read_exact(&mut request)?;
        let descriptor = u32::from_le_bytes(request) as RawFd;

        let fd = if descriptor == endpoint.read_descriptor() {
            Some(endpoint.read_fd())
        } else if descriptor == endpoint.write_descriptor() {
            Some(endpoint.write_fd())
        } else {
            None
        };

        match fd {
            Some(fd) => {
                send_with_fd(&stream, &reply(STATUS_OK), fd)?;
                debug!(descriptor, "served descriptor");
                Ok(BrokerOutcome::Served { descriptor })
            }
            None => {
                stream.write_all(&reply(STATUS_REFUSED))?;
                warn!(descriptor, "refused request for unknown descriptor");
                Ok(BrokerOutcome::Refused { descriptor })
            }
        }
    }

    /// The path this broker is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "scm-rights-broker"
    }
}

impl Drop for DescriptorBroker {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up broker socket");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

impl std::fmt::Debug for DescriptorBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorBroker")
            .field("path", &self.path)
            .finish()
    }
}

fn reply(status: u8) -> [u8; REPLY_LEN] {
    let mut out = [0u8; REPLY_LEN];
    out[0] = status;
    out[1..].copy_from_slice(&std::process::id().to_le_bytes());
    out
}

/// Fetches descriptors from a [`DescriptorBroker`].
///
/// The `process_id` of a target is checked against the broker's owner;
/// `0` accepts whichever process runs the broker.
#[derive(Clone, Debug)]
pub struct SocketAccessor {
    path: PathBuf,
    config: PipeConfig,
}

impl SocketAccessor {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: PipeConfig::default(),
        }
    }

    pub fn with_config(path: impl AsRef<Path>, config: PipeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn attach_error(&self, source: io::Error) -> PipeError {
        PipeError::AttachFailure {
            path: self.path.clone(),
            source,
        }
    }
}

impl EndpointAccessor for SocketAccessor {
    fn open(&self, target: ForeignEndpoint, mode: AccessMode) -> Result<OwnedFd> {
        let mut stream = UnixStream::connect(&self.path).map_err(|e| self.attach_error(e))?;
        stream
            .write_all(&(target.descriptor as u32).to_le_bytes())
            .map_err(|e| self.attach_error(e))?;

        let mut payload = [0u8; REPLY_LEN];
        let (len, fd) = recv_with_fd(&stream, &mut payload).map_err(|e| self.attach_error(e))?;
        if len < REPLY_LEN {
            return Err(self.attach_error(io::Error::new(
                ErrorKind::UnexpectedEof,
                "short reply from descriptor broker",
            )));
        }

        let owner = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        if target.process_id != 0 && owner != target.process_id {
            return Err(self.attach_error(io::Error::new(
                ErrorKind::NotFound,
                format!("broker belongs to pid {owner}, not {}", target.process_id),
            )));
        }
        if payload[0] != STATUS_OK {
            return Err(self.attach_error(io::Error::new(
                ErrorKind::PermissionDenied,
                format!("broker refused descriptor {}", target.descriptor),
            )));
        }

        let fd = fd.ok_or_else(|| {
            self.attach_error(io::Error::new(
                ErrorKind::InvalidData,
                "broker reply carried no descriptor",
            ))
        })?;

        let flags = status_flags(fd.as_fd()).map_err(|e| self.attach_error(e))?;
        if !mode.permitted_by(flags) {
            return Err(self.attach_error(io::Error::new(
                ErrorKind::PermissionDenied,
                format!(
                    "descriptor {} cannot be opened for {}",
                    target.descriptor,
                    mode.as_str()
                ),
            )));
        }

        debug!(path = ?self.path, %target, mode = mode.as_str(), "received brokered descriptor");
        Ok(fd)
    }

    fn buffer_capacity(&self) -> usize {
        self.config.buffer_capacity
    }
}

fn status_flags(fd: BorrowedFd<'_>) -> io::Result<libc::c_int> {
    // SAFETY: F_GETFL on a borrowed, open descriptor has no memory effects.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

/// Control buffer large enough for one `SCM_RIGHTS` message, aligned for `cmsghdr`.
fn control_buffer() -> (Vec<u64>, usize) {
    // SAFETY: CMSG_SPACE only computes a size.
    let space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;
    (vec![0u64; space.div_ceil(8)], space)
}

fn send_with_fd(stream: &UnixStream, payload: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
    let (mut control, space) = control_buffer();
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty message header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg_control points at `space` zeroed, suitably aligned bytes,
    // which CMSG_SPACE guarantees can hold one header carrying one descriptor.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd.as_raw_fd());
    }

    loop {
        // SAFETY: `msg` and everything it points to outlive the call.
        let sent = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        if sent >= 0 {
            if sent as usize != payload.len() {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "short write of broker reply",
                ));
            }
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

fn recv_with_fd(stream: &UnixStream, payload: &mut [u8]) -> io::Result<(usize, Option<OwnedFd>)> {
    let (mut control, space) = control_buffer();
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty message header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    let received = loop {
        // SAFETY: `msg` points at a writable payload and control buffer that
        // outlive the call.
        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, RECV_FLAGS) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut fd = None;
    // SAFETY: the kernel filled `msg_controllen` bytes of control data; the
    // CMSG_* helpers stay within that range, and every SCM_RIGHTS descriptor
    // is freshly installed in this process and owned by nobody else.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let raw = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            "control data truncated",
        ));
    }

    Ok((received, fd))
}
