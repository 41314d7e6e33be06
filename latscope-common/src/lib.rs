//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the event record and the map/program names shared between the
//! kernel-side probes and the userspace consumer. The record uses `#[repr(C)]`
//! so both sides agree on its 16-byte little-endian layout.
//!
//! ## Key Types
//!
//! - [`LatencyEvent`] - One completed invocation, written to the `EVENTS` ring buffer
//!
//! ## Correlation Key
//!
//! Entry and exit probes pair timestamps by `bpf_get_current_pid_tgid()`:
//! the high 32 bits are the process id (TGID), the low 32 bits the thread id.
//! Two threads never share a key. Nested calls on one thread do: the inner
//! entry overwrites the outer start time and the first exit consumes it.

#![no_std]

// ============================================================================
// Map and Program Names
// ============================================================================

/// Ring buffer carrying [`LatencyEvent`] records to userspace
pub const EVENTS_MAP: &str = "EVENTS";

/// Per-CPU counter of records that could not be written to `EVENTS`
pub const DROPPED_MAP: &str = "DROPPED";

/// In-flight invocations: correlation key → entry timestamp (ns)
pub const START_TIMES_MAP: &str = "START_TIMES";

/// Uprobe attached at the function entry (offset 0)
pub const ENTRY_PROGRAM: &str = "latscope_entry";

/// Uprobe attached at every scanned exit offset
pub const EXIT_PROGRAM: &str = "latscope_exit";

/// Uretprobe attached once per function (return-probe exit mode)
pub const RETURN_PROGRAM: &str = "latscope_return";

/// Maximum number of concurrently in-flight invocations tracked by `START_TIMES`
pub const MAX_IN_FLIGHT: u32 = 10240;

/// Default size of the `EVENTS` ring buffer in bytes
pub const DEFAULT_RING_SIZE: u32 = 256 * 1024;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from eBPF to userspace on every matched entry/exit pair
///
/// **Memory Layout**: `#[repr(C)]`, 16 bytes, no padding
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LatencyEvent {
    /// Correlation key: `pid << 32 | tid`
    pub pid_tgid: u64,

    /// Nanoseconds between entry and exit (`bpf_ktime_get_ns()` delta)
    pub latency_ns: u64,
}

impl LatencyEvent {
    /// Size of one record on the wire
    pub const SIZE: usize = 16;
}

/// Split a correlation key into `(pid, tid)`
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_pid_tgid(pid_tgid: u64) -> (u32, u32) {
    ((pid_tgid >> 32) as u32, pid_tgid as u32)
}

/// Pack `(pid, tid)` into a correlation key
#[inline]
#[must_use]
pub const fn pack_pid_tgid(pid: u32, tid: u32) -> u64 {
    ((pid as u64) << 32) | tid as u64
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod lets the struct cross the kernel/userspace boundary as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for LatencyEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_size_matches_wire_format() {
        assert_eq!(core::mem::size_of::<LatencyEvent>(), LatencyEvent::SIZE);
    }

    #[test]
    fn test_split_pid_tgid() {
        let key = pack_pid_tgid(1234, 5678);
        assert_eq!(split_pid_tgid(key), (1234, 5678));
        assert_eq!(split_pid_tgid(u64::MAX), (u32::MAX, u32::MAX));
    }
}
