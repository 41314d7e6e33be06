//! # latscope - Per-Invocation Function Latency via eBPF Uprobes
//!
//! latscope measures how long every call to one function in a running
//! process takes, without recompiling or restarting it. Uprobes are placed at
//! the function entry and at each of its exits; the kernel side pairs them
//! per thread and ships one record per completed call to userspace.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Target Process                            │
//! │          fn handle_request() { ...  ret ... ret }               │
//! └───────────┬──────────────────────────────────┬──────────────────┘
//!             │ entry (offset 0)                 │ exits (scanned rets,
//!             ▼                                  ▼  or one uretprobe)
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │   START_TIMES[pid_tgid] = now  ──▶  now - START_TIMES[pid_tgid] │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ EVENTS ring buffer (+ DROPPED count)
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      latscope (This Crate)                      │
//! │                                                                 │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐      │
//! │  │ Inspect  │──▶│  Probes  │   │ Consumer │──▶│   Sink   │      │
//! │  │  (ELF)   │   │ (attach) │   │  (read)  │   │ text/json│      │
//! │  └──────────┘   └──────────┘   └──────────┘   └──────────┘      │
//! │        └───────────── Lifecycle controller ─────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`inspect`]: Symbol lookup and return-instruction scan (no process access)
//! - [`probes`]: All-or-nothing attach of the entry and exit probes
//! - [`consumer`]: Ring buffer reads, record decoding, sinks and statistics
//! - [`lifecycle`]: Startup, run and ordered teardown of one session
//! - [`platform`]: aya-backed loading of the eBPF object and maps
//! - [`process`]: pidfd handle on the target and its mappings
//! - [`preflight`]: Privilege and kernel checks
//! - [`process_lookup`]: PID and executable resolution via `/proc`
//! - [`cli`]: Command-line arguments
//! - [`domain`]: Core types and errors
//!
//! ## Exit Strategies
//!
//! 1. **Scan** (default): every `ret` found in the function body gets a
//!    uprobe. Advisory: bytes inside other instructions can match, tail-call
//!    exits are missed.
//! 2. **Return probe** (`--exit-mode return-probe`): one uretprobe; exact, at
//!    the cost of a return-address trampoline per call.
//!
//! ## Typical Usage
//!
//! ```bash
//! cargo xtask build-ebpf
//! sudo ./latscope my-app --symbol handle_request
//! sudo ./latscope --pid 1234 --symbol 'my_app::handler' --format json --stats
//! ```
//!
//! ## Known Limitations
//!
//! - Nested calls on one thread share a correlation key: the inner entry
//!   overwrites the outer start time, and the first exit consumes it. Recursive
//!   functions report the innermost call only.
//! - Calls already in flight when the probes attach have no start time and are
//!   not reported.
//! - Every call pays the probe overhead, which is included in the reported
//!   latency.

pub mod cli;
pub mod consumer;
pub mod domain;
pub mod inspect;
pub mod lifecycle;
pub mod platform;
pub mod preflight;
pub mod probes;
pub mod process;
pub mod process_lookup;

#[cfg(test)]
mod testing;
