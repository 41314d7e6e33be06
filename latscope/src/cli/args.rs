//! CLI argument definitions

use clap::{Parser, ValueEnum};
use latscope_common::DEFAULT_RING_SIZE;
use std::path::PathBuf;

use crate::lifecycle::ExitMode;
use crate::platform::ObjectSource;

/// How samples are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// `Handler latency: 12.345 ms (PID: 1, TID: 2)`
    #[default]
    Text,
    /// One JSON object per line: `{"pid":1,"tid":2,"latency_ms":12.345}`
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "latscope",
    version,
    about = "Measure the latency of every call to one function in a running process",
    long_about = "Measure the latency of every call to one function in a running process.\n\n\
        Probes are placed at the function entry and at each of its exits. Every call \
        traps into the kernel twice while latscope runs, which slows the target and \
        adds a few microseconds to each reported latency.",
    after_help = "\
EXAMPLES:
    sudo latscope my-app --symbol handle_request             Auto-detect PID and binary
    sudo latscope --pid 1234 --symbol handle_request         Explicit PID
    sudo latscope --pid 1234 --target ./libsvc.so --symbol svc_handle
    sudo latscope my-app --symbol 'my_app::handler' --exit-mode return-probe --stats"
)]
pub struct Args {
    /// Process name to measure (auto-detects PID and binary)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to measure (binary path auto-detected from /proc)
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Binary containing the function (defaults to the process executable)
    #[arg(short, long)]
    pub target: Option<PathBuf>,

    /// Function to measure: raw symbol name or demangled Rust path
    #[arg(short, long)]
    pub symbol: String,

    /// How function exits are found and probed
    #[arg(long, value_enum, default_value_t = ExitMode::Scan)]
    pub exit_mode: ExitMode,

    /// Sample output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Print a latency summary on exit
    #[arg(long)]
    pub stats: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Event ring buffer size in bytes (power of two, multiple of the page size)
    #[arg(long, default_value_t = DEFAULT_RING_SIZE, value_parser = parse_ring_size)]
    pub ring_size: u32,

    /// Compiled eBPF object to load
    #[arg(long, value_name = "FILE", default_value_os_t = ObjectSource::default_path())]
    pub ebpf_object: PathBuf,

    /// Load the eBPF object compiled into this binary instead of --ebpf-object
    #[cfg(feature = "embedded")]
    #[arg(long, conflicts_with = "ebpf_object")]
    pub embedded: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn object_source(&self) -> ObjectSource {
        #[cfg(feature = "embedded")]
        {
            if self.embedded {
                return ObjectSource::Embedded;
            }
        }
        ObjectSource::File(self.ebpf_object.clone())
    }
}

/// Page size assumed for validation; the kernel rejects anything else at load
const PAGE_SIZE: u32 = 4096;

fn parse_ring_size(value: &str) -> Result<u32, String> {
    let size: u32 = value.parse().map_err(|e| format!("{e}"))?;
    if !size.is_power_of_two() || size < PAGE_SIZE {
        return Err(format!("{size} is not a power of two of at least {PAGE_SIZE} bytes"));
    }
    Ok(size)
}
