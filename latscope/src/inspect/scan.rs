//! Linear scan for x86-64 return instructions
//!
//! This is not a disassembler. Bytes are examined one at a time and only the
//! two return encodings are recognized:
//!
//! - `C3` - `ret`
//! - `C2 iw` - `ret imm16`, whose two immediate bytes are skipped
//!
//! A `C3`/`C2` byte inside a longer instruction (an immediate, a ModRM byte, a
//! displacement) is reported as well, and epilogues that leave through a tail
//! call `jmp` are missed. Treat the result as advisory; the return-probe exit
//! mode does not depend on it.

use std::collections::BTreeSet;

/// Near return
pub const RET: u8 = 0xC3;

/// Near return popping `imm16` bytes of arguments
pub const RET_IMM16: u8 = 0xC2;

/// Length of the `ret imm16` immediate operand
const IMM16_LEN: usize = 2;

/// Offsets (relative to the symbol start) believed to terminate the function
///
/// Offset 0 is never present: it is the entry point and is probed separately.
/// Every offset is strictly below the symbol size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitOffsets(BTreeSet<u64>);

impl ExitOffsets {
    /// Build a set from candidate offsets, dropping 0, duplicates and anything
    /// outside `[0, size)`
    #[must_use]
    pub fn from_candidates(size: u64, candidates: impl IntoIterator<Item = u64>) -> Self {
        Self(candidates.into_iter().filter(|&offset| offset != 0 && offset < size).collect())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        self.0.contains(&offset)
    }

    /// Offsets in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }
}

impl<'a> IntoIterator for &'a ExitOffsets {
    type Item = u64;
    type IntoIter = std::iter::Copied<std::collections::btree_set::Iter<'a, u64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}

/// Scan a function body for return instructions
///
/// A `ret imm16` whose immediate would run past the end of `code` is not a
/// complete instruction inside the function and is not reported.
#[must_use]
pub fn scan_returns(code: &[u8]) -> ExitOffsets {
    let mut candidates = Vec::new();
    let mut pos = 0;

    while pos < code.len() {
        match code[pos] {
            RET => {
                candidates.push(pos);
                pos += 1;
            }
            RET_IMM16 => {
                if pos + IMM16_LEN < code.len() {
                    candidates.push(pos);
                }
                pos += 1 + IMM16_LEN;
            }
            _ => pos += 1,
        }
    }

    ExitOffsets::from_candidates(code.len() as u64, candidates.into_iter().map(|p| p as u64))
}
