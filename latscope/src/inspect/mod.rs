//! # Binary Inspector
//!
//! Finds a function in an ELF executable and the offsets of its return
//! instructions. Pure file inspection: no process or kernel interaction.
//!
//! ## Functions
//!
//! - [`resolve_exits()`] - Symbol lookup plus return scan (scan exit mode)
//! - [`inspect_exits()`] - Same, also returning the resolved [`SymbolRange`]
//! - [`resolve_symbol()`] - Symbol lookup only (return-probe exit mode)
//!
//! Both accept raw symbol names and demangled Rust paths.

pub mod scan;
pub mod symbol;

pub use scan::{scan_returns, ExitOffsets};
pub use symbol::{find_symbol, ResolvedSymbol, SymbolRange};

use log::{debug, info};
use object::{Architecture, Object};
use std::fs;
use std::path::Path;

use crate::domain::InspectError;

/// Locate `symbol` in `binary` and scan its body for return instructions
///
/// The result may be empty (a function that never returns, or one that only
/// leaves through tail calls). Offsets are relative to the symbol start.
///
/// # Errors
/// - [`InspectError::Io`] when the file cannot be read
/// - [`InspectError::MalformedBinary`] when it is not a parsable ELF object
/// - [`InspectError::UnsupportedArchitecture`] for non-x86-64 binaries
/// - [`InspectError::SymbolNotFound`] when the symbol is absent
pub fn resolve_exits(binary: &Path, symbol: &str) -> Result<ExitOffsets, InspectError> {
    inspect_exits(binary, symbol).map(|(_, exits)| exits)
}

/// [`resolve_exits()`], also returning the symbol's range and raw name
///
/// # Errors
/// Same as [`resolve_exits()`]
pub fn inspect_exits(binary: &Path, symbol: &str) -> Result<(SymbolRange, ExitOffsets), InspectError> {
    let data = read_binary(binary)?;
    let obj = parse(&data, binary)?;

    let arch = obj.architecture();
    if arch != Architecture::X86_64 {
        return Err(InspectError::UnsupportedArchitecture {
            binary: binary.to_path_buf(),
            arch: format!("{arch:?}"),
        });
    }

    let resolved = find_symbol(&obj, symbol, binary)?;
    let exits = scan_returns(resolved.code);

    info!(
        "Resolved {} at {:#x} ({} bytes): {} exit offset(s)",
        resolved.range.name,
        resolved.range.address,
        resolved.range.size,
        exits.len()
    );
    debug!("Exit offsets: {:x?}", exits.iter().collect::<Vec<_>>());

    Ok((resolved.range, exits))
}

/// Locate `symbol` in `binary` without scanning its body
///
/// # Errors
/// Same as [`resolve_exits()`], except that any architecture is accepted.
pub fn resolve_symbol(binary: &Path, symbol: &str) -> Result<SymbolRange, InspectError> {
    let data = read_binary(binary)?;
    let obj = parse(&data, binary)?;
    let resolved = find_symbol(&obj, symbol, binary)?;
    Ok(resolved.range)
}

fn read_binary(binary: &Path) -> Result<Vec<u8>, InspectError> {
    fs::read(binary).map_err(|source| InspectError::Io { binary: binary.to_path_buf(), source })
}

fn parse<'data>(data: &'data [u8], binary: &Path) -> Result<object::File<'data>, InspectError> {
    object::File::parse(data).map_err(|e| InspectError::MalformedBinary {
        binary: binary.to_path_buf(),
        reason: e.to_string(),
    })
}
