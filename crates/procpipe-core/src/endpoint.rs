use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Names a descriptor held by another process.
///
/// Carries no ownership. It stays meaningful only while process
/// `process_id` is alive and has `descriptor` open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignEndpoint {
    pub process_id: u32,
    pub descriptor: RawFd,
}

impl ForeignEndpoint {
    pub fn new(process_id: u32, descriptor: RawFd) -> Self {
        Self {
            process_id,
            descriptor,
        }
    }

    /// Pseudo-filesystem path aliasing this descriptor.
    pub fn proc_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/proc/{}/fd/{}",
            self.process_id, self.descriptor
        ))
    }
}

impl fmt::Display for ForeignEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid={} fd={}", self.process_id, self.descriptor)
    }
}

/// Direction a transient descriptor is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// Whether descriptor status flags (from `F_GETFL`) allow this mode.
    pub fn permitted_by(self, status_flags: libc::c_int) -> bool {
        match (self, status_flags & libc::O_ACCMODE) {
            (_, libc::O_RDWR) => true,
            (AccessMode::Read, libc::O_RDONLY) => true,
            (AccessMode::Write, libc::O_WRONLY) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

/// Identity of a created pipe, shared out of band so peers can attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    pub pid: u32,
    pub read_fd: RawFd,
    pub write_fd: RawFd,
}

impl EndpointIdentity {
    pub fn read_end(&self) -> ForeignEndpoint {
        ForeignEndpoint::new(self.pid, self.read_fd)
    }

    pub fn write_end(&self) -> ForeignEndpoint {
        ForeignEndpoint::new(self.pid, self.write_fd)
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid: {}\nwrite_fd: {}\nread_fd: {}",
            self.pid, self.write_fd, self.read_fd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_path_format() {
        let target = ForeignEndpoint::new(4242, 7);
        assert_eq!(target.proc_path(), PathBuf::from("/proc/4242/fd/7"));
    }

    #[test]
    fn access_mode_flags() {
        assert!(AccessMode::Read.permitted_by(libc::O_RDONLY | libc::O_NONBLOCK));
        assert!(!AccessMode::Read.permitted_by(libc::O_WRONLY));
        assert!(AccessMode::Write.permitted_by(libc::O_WRONLY));
        assert!(AccessMode::Write.permitted_by(libc::O_RDWR));
    }

    #[test]
    fn identity_serializes_as_json() {
        let identity = EndpointIdentity {
            pid: 10,
            read_fd: 3,
            write_fd: 4,
        };
        let json = serde_json::to_string(&identity).expect("identity should serialize");
        assert_eq!(json, r#"{"pid":10,"read_fd":3,"write_fd":4}"#);
        assert_eq!(identity.write_end(), ForeignEndpoint::new(10, 4));
    }
}
