//! ELF symbol lookup
//!
//! Resolves a function name to its byte range and machine code using the
//! static (`.symtab`) and dynamic (`.dynsym`) symbol tables.

use object::{Object, ObjectSection, ObjectSymbol, SymbolKind, SymbolSection};
use rustc_demangle::demangle;
use std::path::Path;

use crate::domain::InspectError;

/// Byte range of a function inside the binary
///
/// `size` is never 0: when the symbol table records no size, the range runs
/// to the end of the containing section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRange {
    /// Raw (mangled) name, as the uprobe attach call expects it
    pub name: String,
    /// Symbol value (virtual address, or section offset in relocatable objects)
    pub address: u64,
    pub size: u64,
}

/// A symbol together with the machine code it covers
#[derive(Debug)]
pub struct ResolvedSymbol<'data> {
    pub range: SymbolRange,
    pub code: &'data [u8],
}

/// Find `name` in the symbol tables of `obj`
///
/// Exact raw-name matches win. Otherwise the first defined function whose
/// demangled name (without the Rust hash suffix) equals `name` is used, so
/// `my_app::handler` finds `_ZN6my_app7handler17h…E`.
///
/// # Errors
/// - [`InspectError::SymbolNotFound`] when no defined function matches
/// - [`InspectError::MalformedBinary`] when the symbol's section is invalid or
///   its range falls outside the section data
pub fn find_symbol<'data>(
    obj: &object::File<'data>,
    name: &str,
    binary: &Path,
) -> Result<ResolvedSymbol<'data>, InspectError> {
    let malformed =
        |reason: String| InspectError::MalformedBinary { binary: binary.to_path_buf(), reason };

    let mut demangled_match = None;
    let mut exact_match = None;
    for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
        if symbol.is_undefined() || symbol.kind() != SymbolKind::Text {
            continue;
        }
        let Ok(raw) = symbol.name() else {
            continue;
        };
        if raw == name {
            exact_match = Some(symbol);
            break;
        }
        if demangled_match.is_none() && format!("{:#}", demangle(raw)) == name {
            demangled_match = Some(symbol);
        }
    }

    let symbol = exact_match.or(demangled_match).ok_or_else(|| InspectError::SymbolNotFound {
        symbol: name.to_string(),
        binary: binary.to_path_buf(),
    })?;
    let raw_name = symbol.name().map_err(|e| malformed(e.to_string()))?.to_string();

    let SymbolSection::Section(index) = symbol.section() else {
        return Err(malformed(format!("`{raw_name}` has no containing section")));
    };
    let section = obj
        .section_by_index(index)
        .map_err(|e| malformed(format!("`{raw_name}` section index {}: {e}", index.0)))?;

    let offset = symbol
        .address()
        .checked_sub(section.address())
        .ok_or_else(|| malformed(format!("`{raw_name}` lies before its section")))?;

    // Size 0 means "unknown": extend to the end of the section
    let size = if symbol.size() == 0 {
        section.size().saturating_sub(offset)
    } else {
        symbol.size()
    };
    if size == 0 {
        return Err(malformed(format!("`{raw_name}` is empty")));
    }

    let data = section.data().map_err(|e| malformed(e.to_string()))?;
    let code = usize::try_from(offset)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
        .ok_or_else(|| {
            malformed(format!(
                "`{raw_name}` range {offset:#x}+{size:#x} exceeds section data ({:#x} bytes)",
                data.len()
            ))
        })?;

    Ok(ResolvedSymbol {
        range: SymbolRange { name: raw_name, address: symbol.address(), size },
        code,
    })
}
