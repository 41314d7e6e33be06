//! Newtypes for identifiers that cross the kernel/userspace boundary

use latscope_common::{pack_pid_tgid, split_pid_tgid};
use std::fmt;

/// Process ID (TGID in kernel terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID (kernel PID of the thread)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Key pairing an entry with its exit: `pid << 32 | tid`
///
/// Produced by `bpf_get_current_pid_tgid()` on the kernel side. Unique per
/// thread, so concurrent calls on different threads never collide. Nested
/// calls on the same thread share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey(pub u64);

impl CorrelationKey {
    #[must_use]
    pub const fn new(pid: u32, tid: u32) -> Self {
        Self(pack_pid_tgid(pid, tid))
    }

    /// Process id (high 32 bits)
    #[must_use]
    pub const fn pid(self) -> u32 {
        split_pid_tgid(self.0).0
    }

    /// Thread id (low 32 bits)
    #[must_use]
    pub const fn tid(self) -> u32 {
        split_pid_tgid(self.0).1
    }
}

/// Which side of the function a probe instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Entry,
    Exit,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => f.write_str("entry"),
            Self::Exit => f.write_str("exit"),
        }
    }
}

/// Where a single probe is attached, relative to the symbol start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePoint {
    /// Function entry (offset 0)
    Entry,
    /// A return instruction found by the exit scan
    Exit { offset: u64 },
    /// Kernel-managed return probe on the function (no offset)
    Return,
}

impl ProbePoint {
    #[must_use]
    pub const fn kind(self) -> ProbeKind {
        match self {
            Self::Entry => ProbeKind::Entry,
            Self::Exit { .. } | Self::Return => ProbeKind::Exit,
        }
    }

    /// Offset passed to the uprobe attach call
    #[must_use]
    pub const fn offset(self) -> u64 {
        match self {
            Self::Entry | Self::Return => 0,
            Self::Exit { offset } => offset,
        }
    }
}

impl fmt::Display for ProbePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => f.write_str("entry probe at +0x0"),
            Self::Exit { offset } => write!(f, "exit probe at +{offset:#x}"),
            Self::Return => f.write_str("return probe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_key_split() {
        let key = CorrelationKey::new(1234, 5678);
        assert_eq!(key.pid(), 1234);
        assert_eq!(key.tid(), 5678);
        assert_eq!(key.0, (1234u64 << 32) | 5678);
    }

    #[test]
    fn test_probe_point_kind_and_offset() {
        assert_eq!(ProbePoint::Entry.kind(), ProbeKind::Entry);
        assert_eq!(ProbePoint::Exit { offset: 0x1f }.offset(), 0x1f);
        assert_eq!(ProbePoint::Return.kind(), ProbeKind::Exit);
        assert_eq!(ProbePoint::Exit { offset: 0x1f }.to_string(), "exit probe at +0x1f");
    }
}
