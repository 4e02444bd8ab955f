//! One shared pipe per process.
//!
//! Prefer constructing a [`PipeContext`] at startup and passing it to the
//! components that need it. [`instance`] and the forwarding functions below
//! provide the same thing as a lazily created process-wide value for code
//! that cannot thread a context through.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::endpoint::EndpointIdentity;
use crate::error::Result;
use crate::pipe::{PipeConfig, PipeCore};

/// Cheaply clonable handle to one initialized [`PipeCore`].
#[derive(Clone, Debug)]
pub struct PipeContext {
    pipe: Arc<PipeCore>,
    identity: EndpointIdentity,
}

impl PipeContext {
    pub fn new() -> Result<Self> {
        Self::with_config(PipeConfig::default())
    }

    pub fn with_config(config: PipeConfig) -> Result<Self> {
        let pipe = PipeCore::open(config)?;
        let identity = pipe.identity()?;
        Ok(Self {
            pipe: Arc::new(pipe),
            identity,
        })
    }

    pub fn identity(&self) -> EndpointIdentity {
        self.identity
    }

    pub fn pid(&self) -> u32 {
        self.identity.pid
    }

    pub fn read_descriptor(&self) -> RawFd {
        self.identity.read_fd
    }

    pub fn write_descriptor(&self) -> RawFd {
        self.identity.write_fd
    }

    pub fn read(&self) -> Result<Bytes> {
        self.pipe.read()
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.pipe.write(data)
    }

    /// The underlying pipe, e.g. for serving it through a broker.
    pub fn pipe(&self) -> &PipeCore {
        &self.pipe
    }
}

static INSTANCE: Mutex<Option<PipeContext>> = Mutex::new(None);

/// The process-wide pipe, created on first call.
///
/// First construction happens under a lock, so concurrent callers always
/// observe the same pipe. A failed construction is returned to the caller
/// and attempted again on the next call.
pub fn instance() -> Result<PipeContext> {
    let mut slot = INSTANCE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(context) = slot.as_ref() {
        return Ok(context.clone());
    }

    let context = PipeContext::new()?;
    debug!(identity = ?context.identity(), "created process-wide pipe");
    *slot = Some(context.clone());
    Ok(context)
}

pub fn pid() -> Result<u32> {
    instance().map(|c| c.pid())
}

pub fn read_descriptor() -> Result<RawFd> {
    instance().map(|c| c.read_descriptor())
}

pub fn write_descriptor() -> Result<RawFd> {
    instance().map(|c| c.write_descriptor())
}

pub fn read() -> Result<Bytes> {
    instance()?.read()
}

pub fn write(data: &[u8]) -> Result<usize> {
    instance()?.write(data)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;

    #[test]
    fn context_clones_share_one_pipe() {
        let context = PipeContext::new().unwrap();
        let other = context.clone();
        context.write(b"shared").unwrap();
        assert_eq!(other.read().unwrap().as_ref(), b"shared");
        assert_eq!(context.identity(), other.identity());
    }

    #[test]
    fn separate_contexts_are_isolated() {
        let a = PipeContext::new().unwrap();
        let b = PipeContext::new().unwrap();
        assert_ne!(a.read_descriptor(), b.read_descriptor());
        assert_eq!(a.pid(), b.pid());
    }

    #[test]
    fn instance_is_stable_across_calls() {
        let first = instance().unwrap().identity();
        for _ in 0..8 {
            assert_eq!(instance().unwrap().identity(), first);
        }
        assert_eq!(pid().unwrap(), std::process::id());
        assert_eq!(read_descriptor().unwrap(), first.read_fd);
        assert_eq!(write_descriptor().unwrap(), first.write_fd);
    }

    #[test]
    fn concurrent_first_access_builds_one_pipe() {
        let identities: HashSet<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| instance().unwrap().identity()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(identities.len(), 1);
    }

    #[test]
    fn forwarding_round_trip() {
        // Only this test writes to the process-wide pipe.
        assert_eq!(write(b"global").unwrap(), 6);
        assert_eq!(read().unwrap().as_ref(), b"global");
    }
}
