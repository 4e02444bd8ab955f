//! Anonymous pipes shared across processes by pid and descriptor number.
//!
//! procpipe lets one process create an ordinary anonymous pipe and any other
//! process that learns its pid and descriptor numbers attach to it, without
//! creating a named FIFO in the filesystem.
//!
//! # Crate Structure
//!
//! - [`pipe`] — pipe ownership, cross-process accessors, descriptor broker
//!   and the shared per-process pipe
//!
//! The `procpipe` binary (behind the `cli` feature) exposes the same
//! operations from the command line.

/// Re-export core pipe types.
pub mod pipe {
    pub use procpipe_core::*;
}
