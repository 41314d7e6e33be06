//! Domain model for latscope
//!
//! Core types shared by the inspector, the attachment manager and the
//! consumer, plus the structured errors each of them reports.

pub mod errors;
pub mod types;

pub use types::{CorrelationKey, Pid, ProbeKind, ProbePoint, Tid};

pub use errors::{AttachError, ChannelError, DecodeError, InspectError};
