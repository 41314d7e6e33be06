//! Structured error types for latscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::ProbePoint;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while locating the function and its exits in the binary
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Symbol `{symbol}` not found in {}", binary.display())]
    SymbolNotFound { symbol: String, binary: PathBuf },

    #[error("Malformed binary {}: {reason}", binary.display())]
    MalformedBinary { binary: PathBuf, reason: String },

    #[error("Unsupported architecture {arch} in {}: exit scanning handles x86-64 only", binary.display())]
    UnsupportedArchitecture { binary: PathBuf, arch: String },

    #[error("No return instructions found in `{symbol}`; retry with --exit-mode return-probe")]
    NoExits { symbol: String },

    #[error("Failed to read {}: {source}", binary.display())]
    Io {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while instrumenting the target
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Failed to attach {point}: {cause}")]
    AttachFailed { point: ProbePoint, cause: String },

    #[error("eBPF program {0} not found")]
    ProgramNotFound(String),

    #[error("Failed to load eBPF program {program}: {cause}")]
    Load { program: String, cause: String },
}

/// Outcome of a channel read other than a batch
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Orderly shutdown; not a failure
    #[error("event channel closed")]
    Closed,

    #[error("transient event channel read error: {0}")]
    Transient(#[from] std::io::Error),

    #[error("event channel permanently unreadable: {0}")]
    Unreadable(String),
}

/// A record that does not match the 16-byte wire layout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record is {len} bytes, expected {expected}")]
    WrongLength { len: usize, expected: usize },
}
