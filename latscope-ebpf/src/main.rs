//! # eBPF Kernel-Side Instrumentation
//!
//! Uprobe programs that time one userspace function per invocation.
//!
//! ## Programs
//!
//! - **Uprobe**: `latscope_entry` - Function entry (offset 0), records the start time
//! - **Uprobe**: `latscope_exit` - Attached at every scanned return instruction
//! - **Uretprobe**: `latscope_return` - Single return probe (return-probe exit mode)
//!
//! ## Maps (Shared with Userspace)
//!
//! - `START_TIMES` - Correlation key (pid_tgid) → entry timestamp
//! - `EVENTS` - Ring buffer of `LatencyEvent` records
//! - `DROPPED` - Per-CPU count of records the ring buffer had no room for
//!
//! ## Build
//!
//! Always compiled in release mode (debug includes incompatible formatting code):
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns},
    macros::{map, uprobe, uretprobe},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use latscope_common::{LatencyEvent, DEFAULT_RING_SIZE, MAX_IN_FLIGHT};

// ============================================================================
// eBPF Maps
// ============================================================================

/// Map: correlation key (pid_tgid) → entry timestamp in nanoseconds
///
/// Entries live from the entry probe until the first exit probe of the same
/// thread. Sized for concurrently in-flight invocations, not total calls.
#[map]
static START_TIMES: HashMap<u64, u64> = HashMap::with_max_entries(MAX_IN_FLIGHT, 0);

/// Ring buffer for completed invocations
///
/// Userspace may resize it before load (`--ring-size`).
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_SIZE, 0);

/// Records that failed ring buffer reservation (buffer full)
///
/// Userspace sums all CPUs and reports the delta per read as lost samples.
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: function entry
#[uprobe]
pub fn latscope_entry(_ctx: ProbeContext) -> u32 {
    match try_entry() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_entry() -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let start = unsafe { bpf_ktime_get_ns() };

    // BPF_ANY: a nested call on the same thread overwrites the outer start time
    START_TIMES.insert(&pid_tgid, &start, 0)?;
    Ok(())
}

/// Hook: one of the function's return instructions
#[uprobe]
pub fn latscope_exit(ctx: ProbeContext) -> u32 {
    match try_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: function return (kernel-managed return address trampoline)
#[uretprobe]
pub fn latscope_return(ctx: RetProbeContext) -> u32 {
    match try_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_exit<C: EbpfContext>(ctx: &C) -> Result<(), i64> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };

    // Exit without a recorded entry: attached mid-call, or the start time was
    // already consumed by an inner exit on this thread
    let Some(start) = (unsafe { START_TIMES.get(&pid_tgid).copied() }) else {
        debug!(ctx, "exit without entry for {}", pid_tgid);
        return Ok(());
    };

    let now = unsafe { bpf_ktime_get_ns() };
    let event = LatencyEvent { pid_tgid, latency_ns: now.saturating_sub(start) };

    if EVENTS.output(&event, 0).is_err() {
        count_dropped();
    }

    START_TIMES.remove(&pid_tgid)?;
    Ok(())
}

fn count_dropped() {
    if let Some(counter) = DROPPED.get_ptr_mut(0) {
        // Per-CPU slot: no other writer can race this increment
        unsafe { *counter += 1 };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
