//! # Probe Attachment Manager
//!
//! Attaches the entry probe and every exit probe of one function, all or
//! nothing, and releases them exactly once.
//!
//! ## Functions
//!
//! - [`attach()`] - Entry first, then each exit; rolls back on the first failure
//! - [`AttachmentSet::detach()`] - Release every held probe (idempotent)
//!
//! The kernel side is behind [`ProbeBackend`]; [`UprobeBackend`] is the aya
//! implementation.
//!
//! ## Overhead
//!
//! Every call of the instrumented function traps into the kernel at entry and
//! again at the exit it leaves through (a few microseconds each on typical
//! hardware). The measured latency includes the entry probe's tail and the
//! exit probe's head; the target runs slower for as long as probes are held.

pub mod uprobe;

pub use uprobe::{load_programs, UprobeBackend};

use log::{debug, info, warn};
use std::fmt::Display;

use crate::domain::{AttachError, ProbeKind, ProbePoint};
use crate::inspect::ExitOffsets;

/// Kernel-facing half of probe attachment
///
/// `attach` returns an opaque token that `detach` consumes, so a probe can
/// only be released once.
pub trait ProbeBackend {
    /// OS-level resource identifying one attached probe
    type Token;
    type Error: Display;

    /// Attach a probe for `point` on the function `symbol`
    ///
    /// # Errors
    /// Backend-specific attach failure
    fn attach(&mut self, symbol: &str, point: ProbePoint) -> Result<Self::Token, Self::Error>;

    /// Release a probe previously returned by [`ProbeBackend::attach`]
    ///
    /// # Errors
    /// Backend-specific detach failure
    fn detach(&mut self, point: ProbePoint, token: Self::Token) -> Result<(), Self::Error>;
}

/// How exits are instrumented
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPlan {
    /// One uprobe per scanned return instruction
    Offsets(ExitOffsets),
    /// One kernel return probe (uretprobe)
    ReturnProbe,
}

impl ExitPlan {
    fn points(&self) -> Vec<ProbePoint> {
        match self {
            Self::Offsets(offsets) => {
                offsets.iter().map(|offset| ProbePoint::Exit { offset }).collect()
            }
            Self::ReturnProbe => vec![ProbePoint::Return],
        }
    }
}

/// One attached probe
#[derive(Debug)]
pub struct ProbeHandle<T> {
    pub point: ProbePoint,
    token: T,
}

impl<T> ProbeHandle<T> {
    #[must_use]
    pub fn kind(&self) -> ProbeKind {
        self.point.kind()
    }
}

/// Every probe attached for one function
///
/// Owned by whoever called [`attach()`]. Dropping it without calling
/// [`AttachmentSet::detach()`] leaves release to the backend's own drop.
#[derive(Debug)]
pub struct AttachmentSet<T> {
    symbol: String,
    handles: Vec<ProbeHandle<T>>,
}

impl<T> AttachmentSet<T> {
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Number of probes still held
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = ProbePoint> + '_ {
        self.handles.iter().map(|handle| handle.point)
    }

    /// Release every held probe, most recently attached first
    ///
    /// A probe whose release fails is logged and not retried: its token is
    /// consumed either way. Calling this on an already released set does
    /// nothing. Returns the number of probes released by this call.
    pub fn detach<B>(&mut self, backend: &mut B) -> usize
    where
        B: ProbeBackend<Token = T>,
    {
        let released = self.handles.len();
        release_all(backend, &mut self.handles);
        if released > 0 {
            info!("✓ Detached {released} probe(s) from {}", self.symbol);
        }
        released
    }
}

/// Attach the entry probe, then one probe per exit in `plan`
///
/// If any attach fails, every probe attached so far (entry included) is
/// released before the error is returned; the caller never holds a partial
/// set.
///
/// # Errors
/// [`AttachError::AttachFailed`] naming the first point that failed
pub fn attach<B: ProbeBackend>(
    backend: &mut B,
    symbol: &str,
    plan: &ExitPlan,
) -> Result<AttachmentSet<B::Token>, AttachError> {
    let points: Vec<ProbePoint> = std::iter::once(ProbePoint::Entry).chain(plan.points()).collect();
    let mut handles = Vec::with_capacity(points.len());

    for point in points {
        match backend.attach(symbol, point) {
            Ok(token) => {
                debug!("Attached {point} on {symbol}");
                handles.push(ProbeHandle { point, token });
            }
            Err(e) => {
                warn!("Failed to attach {point} on {symbol}: {e}; rolling back {} probe(s)", handles.len());
                release_all(backend, &mut handles);
                return Err(AttachError::AttachFailed { point, cause: e.to_string() });
            }
        }
    }

    info!("✓ Attached {} probe(s) to {symbol}", handles.len());
    Ok(AttachmentSet { symbol: symbol.to_string(), handles })
}

fn release_all<B: ProbeBackend>(backend: &mut B, handles: &mut Vec<ProbeHandle<B::Token>>) {
    while let Some(ProbeHandle { point, token }) = handles.pop() {
        if let Err(e) = backend.detach(point, token) {
            warn!("Failed to detach {point}: {e}");
        }
    }
}
