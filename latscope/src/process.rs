//! Handle on the target process
//!
//! A pidfd keeps referring to the same process for as long as it is open,
//! even if the PID is recycled, and becomes readable when the process exits.

#![allow(unsafe_code)] // pidfd_open has no libc wrapper

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use std::fs;
use std::future::Future;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::domain::Pid;

/// Open pidfd on the target; closed on drop
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    fd: OwnedFd,
}

impl ProcessHandle {
    /// Open a pidfd for `pid`
    ///
    /// # Errors
    /// The process does not exist, or the kernel lacks `pidfd_open` (< 5.3)
    pub fn open(pid: Pid) -> Result<Self> {
        // SAFETY: pidfd_open takes (pid_t, unsigned int) and returns a new fd
        // or -1; no memory is passed
        let ret = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.0, 0) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                bail!(
                    "Process {} not found.\n\n\
                     Is the process still running? Check with: ps -p {}",
                    pid.0,
                    pid.0
                );
            }
            return Err(err).with_context(|| format!("pidfd_open({})", pid.0));
        }
        let raw = RawFd::try_from(ret).context("pidfd out of range")?;
        // SAFETY: `raw` was just returned by the kernel and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        debug!("Opened pidfd {raw} for {pid}");
        Ok(Self { pid, fd })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Future resolving once the process has exited
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// The pidfd cannot be duplicated or registered with the reactor
    pub fn exit_watch(&self) -> io::Result<impl Future<Output = ()> + Send + 'static> {
        let dup = self.fd.try_clone()?;
        // SAFETY: `dup` is owned by the AsyncFd, so the descriptor stays open
        // and refers to this pidfd until the AsyncFd is dropped
        let fd = unsafe { AsyncFd::register_with_interest(dup, Interest::READABLE) }?;
        let pid = self.pid;
        Ok(async move {
            match fd.readable().await {
                Ok(mut guard) => {
                    guard.retain_ready();
                    debug!("{pid} exited");
                }
                Err(e) => {
                    warn!("Cannot watch {pid} for exit: {e}");
                    std::future::pending::<()>().await;
                }
            }
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        debug!("Closing pidfd for {}", self.pid);
    }
}

/// Whether `binary` is mapped into the address space of `pid`
///
/// Probes on a file the target never maps never fire, which looks exactly
/// like an idle function. Compares canonical paths against `/proc/<pid>/maps`.
///
/// # Errors
/// `/proc/<pid>/maps` is unreadable
pub fn maps_binary(pid: Pid, binary: &Path) -> Result<bool> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps =
        fs::read_to_string(&maps_path).with_context(|| format!("Failed to read {maps_path}"))?;
    let wanted = fs::canonicalize(binary).unwrap_or_else(|_| binary.to_path_buf());
    let mapped = mapped_paths(&maps).any(|path| path == wanted);
    Ok(mapped)
}

/// Executable of a running process, from `/proc/<pid>/exe`
///
/// # Errors
/// The process is gone, is a kernel thread, or belongs to another user
pub fn exe_path(pid: Pid) -> Result<PathBuf> {
    let link = format!("/proc/{}/exe", pid.0);
    fs::read_link(&link).with_context(|| format!("Failed to read {link}"))
}

/// File-backed pathnames in a maps listing
///
/// Line format: `start-end perms offset dev inode pathname`
fn mapped_paths(maps: &str) -> impl Iterator<Item = PathBuf> + '_ {
    maps.lines().filter_map(|line| {
        let path = line.split_whitespace().nth(5)?;
        path.starts_with('/').then(|| PathBuf::from(path))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 131 /usr/bin/server
55d0c0a20000-55d0c0b00000 r-xp 00020000 08:01 131 /usr/bin/server
7f1c2c000000-7f1c2c021000 rw-p 00000000 00:00 0
7f1c2d000000-7f1c2d1c0000 r-xp 00000000 08:01 262 /usr/lib/libc.so.6
7ffd5e300000-7ffd5e321000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn test_mapped_paths_skips_anonymous_and_pseudo() {
        let paths: Vec<PathBuf> = mapped_paths(MAPS).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/usr/bin/server"),
                PathBuf::from("/usr/bin/server"),
                PathBuf::from("/usr/lib/libc.so.6"),
            ]
        );
    }

    #[test]
    fn test_open_missing_process() {
        let err = ProcessHandle::open(Pid(i32::MAX)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found") || msg.contains("pidfd_open"), "{msg}");
    }

    #[test]
    fn test_own_executable_is_mapped() {
        let pid = Pid(i32::try_from(std::process::id()).unwrap());
        let exe = std::env::current_exe().unwrap();
        assert!(maps_binary(pid, &exe).unwrap());
        assert!(!maps_binary(pid, Path::new("/nonexistent/binary")).unwrap());
    }

    #[test]
    fn test_exe_path_of_self() {
        let pid = Pid(i32::try_from(std::process::id()).unwrap());
        assert_eq!(exe_path(pid).unwrap(), std::env::current_exe().unwrap());
        assert!(exe_path(Pid(i32::MAX)).is_err());
    }

    #[tokio::test]
    async fn test_exit_watch_fires_after_child_exits() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = Pid(i32::try_from(child.id()).unwrap());
        let Ok(handle) = ProcessHandle::open(pid) else {
            // pidfd unsupported on this kernel
            child.wait().unwrap();
            return;
        };
        let watch = handle.exit_watch().unwrap();
        child.wait().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), watch).await.unwrap();
    }
}
