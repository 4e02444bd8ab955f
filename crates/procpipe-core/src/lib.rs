//! Anonymous pipes that other processes can attach to.
//!
//! A process creates a pipe with [`PipeCore`] (or shares one through
//! [`PipeContext`]) and publishes its pid and descriptor numbers. Any other
//! process holding that [`ForeignEndpoint`] can then open the same pipe:
//! - through `/proc/<pid>/fd/<fd>` on Linux ([`ProcFsAccessor`])
//! - through a [`DescriptorBroker`] socket that passes the descriptor with
//!   `SCM_RIGHTS` ([`SocketAccessor`])
//!
//! The stream is raw bytes. There is no framing, no timeout and no retry:
//! each read or write is exactly one blocking OS call.

#![cfg(unix)]

pub mod accessor;
pub mod broker;
pub mod endpoint;
pub mod error;
pub mod pipe;
pub mod registry;

pub use accessor::{
    inspect, read_or_empty, read_or_empty_with, write_or_sentinel, write_or_sentinel_with,
    AttachedEndpoint, EndpointAccessor, EndpointInfo, ProcFsAccessor, WRITE_FAILED,
};
pub use broker::{BrokerOutcome, DescriptorBroker, SocketAccessor};
pub use endpoint::{AccessMode, EndpointIdentity, ForeignEndpoint};
pub use error::{PipeError, Result};
pub use pipe::{
    PipeConfig, PipeCore, PipeEndpoint, PipeState, DEFAULT_BUFFER_CAPACITY, MAX_BUFFER_CAPACITY,
};
pub use registry::PipeContext;
