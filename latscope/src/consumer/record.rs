//! Wire decoding of [`LatencyEvent`] records

use latscope_common::LatencyEvent;
use serde::Serialize;

use crate::domain::{CorrelationKey, DecodeError};

/// One decoded record: who ran the function and for how long
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRecord {
    pub key: CorrelationKey,
    pub latency_ns: u64,
}

impl LatencyRecord {
    /// Decode the fixed 16-byte little-endian layout
    ///
    /// | offset | size | field |
    /// |---|---|---|
    /// | 0 | 8 | correlation key (`pid << 32 \| tid`) |
    /// | 8 | 8 | latency in nanoseconds |
    ///
    /// # Errors
    /// [`DecodeError::WrongLength`] unless `bytes` is exactly 16 bytes long
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wrong_length = || DecodeError::WrongLength { len: bytes.len(), expected: LatencyEvent::SIZE };
        let raw: &[u8; LatencyEvent::SIZE] = bytes.try_into().map_err(|_| wrong_length())?;

        let (key, latency) = raw.split_at(8);
        let key = u64::from_le_bytes(key.try_into().map_err(|_| wrong_length())?);
        let latency_ns = u64::from_le_bytes(latency.try_into().map_err(|_| wrong_length())?);

        Ok(Self { key: CorrelationKey(key), latency_ns })
    }

    #[must_use]
    pub fn to_sample(self) -> LatencySample {
        LatencySample {
            pid: self.key.pid(),
            tid: self.key.tid(),
            latency_ms: nanos_to_millis(self.latency_ns),
        }
    }
}

/// What a sink receives for every completed invocation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySample {
    pub pid: u32,
    pub tid: u32,
    pub latency_ms: f64,
}

#[allow(clippy::cast_precision_loss)]
fn nanos_to_millis(nanos: u64) -> f64 {
    nanos as f64 / 1_000_000.0
}
