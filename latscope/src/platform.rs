//! # Kernel Platform
//!
//! The [`Platform`] used by the binary: loads the compiled eBPF object, opens
//! the target's pidfd, and wires the `EVENTS`/`DROPPED` maps into a
//! [`RingBufChannel`].

use anyhow::{Context, Result};
use aya::{
    maps::{PerCpuArray, RingBuf},
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use latscope_common::{DROPPED_MAP, EVENTS_MAP};
use log::{info, warn};
use std::path::PathBuf;

use crate::consumer::RingBufChannel;
use crate::domain::Pid;
use crate::lifecycle::{Platform, ShutdownFuture};
use crate::probes::{load_programs, ExitPlan, UprobeBackend};
use crate::process::ProcessHandle;

/// Where the compiled eBPF object comes from
#[derive(Debug, Clone)]
pub enum ObjectSource {
    /// Built by `cargo xtask build-ebpf` and read at startup
    File(PathBuf),
    /// Compiled into the binary (`embedded` feature)
    #[cfg(feature = "embedded")]
    Embedded,
}

impl ObjectSource {
    /// Default location of the object produced by `cargo xtask build-ebpf`
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("target/bpfel-unknown-none/release/latscope")
    }
}

/// aya-backed platform for one target binary
pub struct UprobePlatform {
    object: ObjectSource,
    ring_size: u32,
    target: PathBuf,
}

impl UprobePlatform {
    /// `target` is the file the probes are placed in; `ring_size` sizes the
    /// `EVENTS` ring buffer in bytes (a power of two, multiple of the page size)
    #[must_use]
    pub fn new(object: ObjectSource, ring_size: u32, target: PathBuf) -> Self {
        Self { object, ring_size, target }
    }

    fn load(&self) -> Result<Ebpf> {
        let mut loader = EbpfLoader::new();
        loader.set_max_entries(EVENTS_MAP, self.ring_size);

        let bpf = match &self.object {
            ObjectSource::File(path) => loader.load_file(path).with_context(|| {
                format!(
                    "Failed to load eBPF object {}\n\n\
                     Build it with: cargo xtask build-ebpf",
                    path.display()
                )
            })?,
            #[cfg(feature = "embedded")]
            ObjectSource::Embedded => loader
                .load(aya::include_bytes_aligned!(
                    "../../target/bpfel-unknown-none/release/latscope"
                ))
                .context("Failed to load embedded eBPF object")?,
        };
        Ok(bpf)
    }
}

impl Platform for UprobePlatform {
    type Process = ProcessHandle;
    type Backend = UprobeBackend;
    type Channel = RingBufChannel;

    fn open_process(&mut self, pid: Pid) -> Result<ProcessHandle> {
        ProcessHandle::open(pid)
    }

    fn instrument(
        &mut self,
        process: &ProcessHandle,
        plan: &ExitPlan,
    ) -> Result<(UprobeBackend, RingBufChannel)> {
        let mut bpf = self.load()?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            // No log statements in the object is not an error
            warn!("Failed to initialize eBPF logger: {e}");
        }
        load_programs(&mut bpf, plan)?;

        let ring = RingBuf::try_from(
            bpf.take_map(EVENTS_MAP).with_context(|| format!("{EVENTS_MAP} map not found"))?,
        )?;
        let dropped: PerCpuArray<_, u64> = PerCpuArray::try_from(
            bpf.take_map(DROPPED_MAP).with_context(|| format!("{DROPPED_MAP} map not found"))?,
        )?;
        let channel = RingBufChannel::new(ring, dropped).context("registering ring buffer fd")?;
        info!("✓ Event channel open ({} KiB ring buffer)", self.ring_size / 1024);

        Ok((UprobeBackend::new(bpf, &self.target, process.pid()), channel))
    }

    fn process_exit(&self, process: &ProcessHandle) -> Option<ShutdownFuture> {
        match process.exit_watch() {
            Ok(exited) => Some(Box::pin(exited)),
            Err(e) => {
                warn!("Cannot watch {} for exit, stop with Ctrl+C: {e}", process.pid());
                None
            }
        }
    }
}
