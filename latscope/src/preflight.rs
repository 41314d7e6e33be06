//! Pre-flight checks for latscope
//!
//! Validates system requirements before any probe is loaded, with actionable
//! messages when they aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use object::{Object, ObjectSection};
use std::path::Path;

use crate::domain::Pid;

/// Minimum kernel version: BPF ring buffer (5.8)
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Exit code when the requirements are not met (automake "skip")
pub const EXIT_UNSUPPORTED: i32 = 77;

/// A requirement the host does not meet
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Unsupported(String);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// [`Unsupported`] for missing privilege or an old kernel; other errors for a
/// missing binary or process
pub fn run_preflight_checks(target: &Path, pid: Pid, quiet: bool) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(target)?;
    check_symbol_table(target, quiet);
    check_process_exists(pid)?;
    raise_memlock_rlimit();
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF + CAP_PERFMON would also do; checking them needs more than libc
    Err(Unsupported(
        "Permission denied: latscope requires root privileges to load eBPF programs.\n\n\
         Run with: sudo latscope ..."
            .to_string(),
    )
    .into())
}

/// Check if the kernel version is sufficient for the ring buffer
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_release(release) else {
        debug!("Unparsable kernel release {release}, assuming it is recent enough");
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        return Err(Unsupported(format!(
            "Kernel version {major}.{minor} is too old.\n\n\
             latscope requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0, MIN_KERNEL_VERSION.1
        ))
        .into());
    }
    Ok(())
}

/// `"6.1.0-arch1-1"` → `(6, 1)`
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    Some((major, minor.parse().ok()?))
}

/// Check if the target binary exists and is a file
fn check_binary_exists(target: &Path) -> Result<()> {
    if !target.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            target.display()
        );
    }
    if !target.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --target must point to an executable file, not a directory.",
            target.display()
        );
    }
    Ok(())
}

/// Warn when the binary has no static symbol table
///
/// Only exported functions stay resolvable through `.dynsym`.
fn check_symbol_table(target: &Path, quiet: bool) {
    if quiet {
        return;
    }
    let Ok(data) = std::fs::read(target) else {
        return;
    };
    // Not an object file: the inspector reports it properly
    let Ok(obj) = object::File::parse(&*data) else {
        return;
    };
    if !obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0) {
        warn!(
            "{} is stripped: only exported (dynamic) symbols can be found",
            target.display()
        );
    }
}

/// Check if the target process exists
fn check_process_exists(pid: Pid) -> Result<()> {
    let proc_path = format!("/proc/{}", pid.0);
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {} not found.\n\n\
             Is the process still running? Check with: ps -p {}",
            pid.0,
            pid.0
        );
    }
    Ok(())
}

/// Lift the locked-memory limit for kernels that still charge BPF maps to it (< 5.11)
fn raise_memlock_rlimit() {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_release("5.8"), Some((5, 8)));
        assert_eq!(parse_release("unknown"), None);
    }

    #[test]
    fn test_binary_not_found() {
        let err = check_binary_exists(Path::new("/nonexistent/path/to/binary")).unwrap_err();
        assert!(err.to_string().contains("Binary not found"));
    }

    #[test]
    fn test_directory_is_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_binary_exists(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Not a file"));
    }

    #[test]
    fn test_process_not_found() {
        let err = check_process_exists(Pid(999_999_999)).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_unsupported_is_downcastable() {
        let err: anyhow::Error = Unsupported("too old".to_string()).into();
        assert!(err.downcast_ref::<Unsupported>().is_some());
    }
}
