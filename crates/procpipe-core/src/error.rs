use std::path::PathBuf;

use crate::pipe::PipeState;

/// Errors that can occur in pipe and attach operations.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The OS could not allocate a new pipe (descriptor table limits).
    #[error("cannot allocate pipe: {0}")]
    ResourceExhausted(std::io::Error),

    /// Opening a foreign process's descriptor failed.
    ///
    /// Covers a vanished process, a closed descriptor and permission
    /// denial alike; inspect `source` if the cause matters.
    #[error("cannot attach to {path}: {source}")]
    AttachFailure {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An operation was invoked on a pipe that is not in the `Created` state.
    #[error("cannot {operation}: pipe is {state}")]
    PreconditionViolation {
        operation: &'static str,
        state: PipeState,
    },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to bind the descriptor broker socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// An I/O error occurred on an established descriptor.
    #[error("pipe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipeError {
    /// The underlying OS error, if this failure carries one.
    pub fn io_source(&self) -> Option<&std::io::Error> {
        match self {
            PipeError::ResourceExhausted(source)
            | PipeError::AttachFailure { source, .. }
            | PipeError::Bind { source, .. }
            | PipeError::Io(source) => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipeError>;
