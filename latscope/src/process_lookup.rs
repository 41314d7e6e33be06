//! Pick the target process from a name given on the command line
//!
//! Names are matched against the kernel command name and the executable
//! basename. When several processes match, the ones whose executable defines
//! the function being measured are preferred: a shell script named after the
//! service, or a sibling binary, cannot be instrumented anyway.

use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Pid;
use crate::inspect::resolve_symbol;
use crate::process::exe_path;

/// A running process matching a name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub pid: Pid,
    pub exe_path: PathBuf,
    pub command: String,
}

/// How well a candidate matched, weakest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Strength {
    /// Name is a substring of the command or executable basename
    Partial,
    /// Name equals the command or executable basename
    Exact,
}

/// Find the one process called `name` that can be measured at `symbol`
///
/// # Errors
/// No process matches, or more than one remains after narrowing by symbol
pub fn find_process(name: &str, symbol: &str) -> Result<Candidate> {
    let own = std::process::id();
    let mut found = Vec::new();

    for entry in fs::read_dir("/proc").context("Failed to read /proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        if u32::try_from(pid).is_ok_and(|p| p == own) {
            continue;
        }
        // Kernel threads have no exe; vanished or foreign processes are skipped
        let Ok(exe) = exe_path(Pid(pid)) else {
            continue;
        };
        let Some(command) = fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| comm_of(&stat).map(str::to_string))
        else {
            continue;
        };
        let candidate = Candidate { pid: Pid(pid), exe_path: exe, command };
        if let Some(strength) = strength(&candidate, name) {
            found.push((strength, candidate));
        }
    }

    select(name, symbol, found, |exe| resolve_symbol(exe, symbol).is_ok())
}

/// Narrow matches to a single candidate
///
/// Only the strongest matches are kept. Ties are broken by whether the
/// executable defines `symbol`; `defines` is asked once per distinct
/// executable.
fn select(
    name: &str,
    symbol: &str,
    found: Vec<(Strength, Candidate)>,
    defines: impl Fn(&Path) -> bool,
) -> Result<Candidate> {
    let Some(best) = found.iter().map(|(strength, _)| *strength).max() else {
        bail!(
            "No process matching '{name}' found.\n\
             Check running processes with: ps aux | grep {name}"
        );
    };
    let mut matches: Vec<Candidate> =
        found.into_iter().filter(|(s, _)| *s == best).map(|(_, c)| c).collect();
    if matches.len() == 1 {
        return Ok(matches.remove(0));
    }

    let mut verdicts: HashMap<PathBuf, bool> = HashMap::new();
    for candidate in &matches {
        verdicts
            .entry(candidate.exe_path.clone())
            .or_insert_with(|| defines(&candidate.exe_path));
    }
    let defining: Vec<&Candidate> =
        matches.iter().filter(|c| verdicts.get(&c.exe_path).copied().unwrap_or(false)).collect();
    debug!("{} processes match '{name}', {} define {symbol}", matches.len(), defining.len());

    if let [only] = defining.as_slice() {
        return Ok((*only).clone());
    }

    let list: Vec<String> = matches
        .iter()
        .map(|c| {
            let mark = if verdicts.get(&c.exe_path).copied().unwrap_or(false) {
                format!("defines {symbol}")
            } else {
                format!("no {symbol}")
            };
            format!("  {} ({}, {}, {mark})", c.pid.0, c.command, c.exe_path.display())
        })
        .collect();
    bail!(
        "Multiple processes match '{name}':\n{}\n\n\
         Specify PID explicitly: latscope --pid <PID> --symbol {symbol}",
        list.join("\n")
    )
}

/// Command name from `/proc/<pid>/stat`: `pid (comm) state ...`
///
/// `comm` may itself contain parentheses, so the last `)` closes it.
fn comm_of(stat: &str) -> Option<&str> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    stat.get(open + 1..close)
}

fn strength(candidate: &Candidate, pattern: &str) -> Option<Strength> {
    let exe = candidate.exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let wanted = Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    if candidate.command == wanted || exe == wanted {
        Some(Strength::Exact)
    } else if candidate.command.contains(pattern) || exe.contains(pattern) {
        Some(Strength::Partial)
    } else {
        None
    }
}
