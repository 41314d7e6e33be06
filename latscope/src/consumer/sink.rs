//! Reporting sinks for latency samples and consumer diagnostics

use log::warn;
use std::fmt;
use std::io::Write;

use super::record::LatencySample;
use crate::domain::DecodeError;

/// Non-fatal conditions the consumer reports alongside samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// The producer had no room for this many records since the last read
    SamplesDropped(u64),
    /// A record that does not decode; skipped
    MalformedRecord(DecodeError),
    /// A read that failed and will be retried
    ReadError(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SamplesDropped(count) => {
                write!(f, "ring buffer full, dropped {count} samples")
            }
            Self::MalformedRecord(reason) => write!(f, "malformed record skipped: {reason}"),
            Self::ReadError(reason) => write!(f, "event read failed, retrying: {reason}"),
        }
    }
}

/// Destination of decoded samples
pub trait LatencySink {
    fn sample(&mut self, sample: &LatencySample);

    /// Diagnostics are logged by default
    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        warn!("{diagnostic}");
    }

    /// Called once when the consumer stops
    fn finish(&mut self) {}
}

impl<S: LatencySink + ?Sized> LatencySink for Box<S> {
    fn sample(&mut self, sample: &LatencySample) {
        (**self).sample(sample);
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        (**self).diagnostic(diagnostic);
    }

    fn finish(&mut self) {
        (**self).finish();
    }
}

/// `Handler latency: 5.000 ms (PID: 1234, TID: 5678)` per sample
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> LatencySink for TextSink<W> {
    fn sample(&mut self, sample: &LatencySample) {
        if let Err(e) = writeln!(
            self.out,
            "Handler latency: {:.3} ms (PID: {}, TID: {})",
            sample.latency_ms, sample.pid, sample.tid
        ) {
            warn!("Failed to write sample: {e}");
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("Failed to flush output: {e}");
        }
    }
}

/// One JSON object per line: `{"pid":1234,"tid":5678,"latency_ms":5.0}`
pub struct JsonSink<W: Write> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> LatencySink for JsonSink<W> {
    fn sample(&mut self, sample: &LatencySample) {
        let written = serde_json::to_writer(&mut self.out, sample)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("Failed to write sample: {e}");
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("Failed to flush output: {e}");
        }
    }
}

/// Aggregate over every sample and diagnostic seen
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
    pub dropped: u64,
    pub malformed: u64,
}

impl LatencyStats {
    pub fn record(&mut self, latency_ms: f64) {
        if self.count == 0 {
            self.min_ms = latency_ms;
            self.max_ms = latency_ms;
        } else {
            self.min_ms = self.min_ms.min(latency_ms);
            self.max_ms = self.max_ms.max(latency_ms);
        }
        self.count += 1;
        self.total_ms += latency_ms;
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_ms(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total_ms / self.count as f64)
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean_ms() {
            Some(mean) => write!(
                f,
                "{} calls, min {:.3} ms, mean {:.3} ms, max {:.3} ms",
                self.count, self.min_ms, mean, self.max_ms
            )?,
            None => write!(f, "0 calls")?,
        }
        write!(f, " ({} dropped, {} malformed)", self.dropped, self.malformed)
    }
}

/// Pass-through sink that keeps [`LatencyStats`]
pub struct StatsSink<S> {
    inner: S,
    stats: LatencyStats,
}

impl<S: LatencySink> StatsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, stats: LatencyStats::default() }
    }

    #[must_use]
    pub fn stats(&self) -> &LatencyStats {
        &self.stats
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: LatencySink> LatencySink for StatsSink<S> {
    fn sample(&mut self, sample: &LatencySample) {
        self.stats.record(sample.latency_ms);
        self.inner.sample(sample);
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::SamplesDropped(count) => self.stats.dropped += count,
            Diagnostic::MalformedRecord(_) => self.stats.malformed += 1,
            Diagnostic::ReadError(_) => {}
        }
        self.inner.diagnostic(diagnostic);
    }

    fn finish(&mut self) {
        self.inner.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(latency_ms: f64) -> LatencySample {
        LatencySample { pid: 1234, tid: 5678, latency_ms }
    }

    /// Accepts writes, refuses to flush
    struct BrokenPipe {
        written: Vec<u8>,
        flushes: usize,
    }

    impl Write for BrokenPipe {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_failed_flush_on_finish_is_reported_not_fatal() {
        let mut text = TextSink::new(BrokenPipe { written: Vec::new(), flushes: 0 });
        text.sample(&sample(5.0));
        text.finish();
        let pipe = text.into_inner();
        assert_eq!(pipe.flushes, 1);
        assert!(!pipe.written.is_empty());

        let mut json = JsonSink::new(BrokenPipe { written: Vec::new(), flushes: 0 });
        json.sample(&sample(5.0));
        json.finish();
        let pipe = json.into_inner();
        assert_eq!(pipe.flushes, 1);
        assert!(pipe.written.ends_with(b"\n"));
    }

    #[test]
    fn test_text_sink_reference_format() {
        let mut sink = TextSink::new(Vec::new());
        sink.sample(&sample(5.0));
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "Handler latency: 5.000 ms (PID: 1234, TID: 5678)\n");
    }

    #[test]
    fn test_json_sink_one_object_per_line() {
        let mut sink = JsonSink::new(Vec::new());
        sink.sample(&sample(1.5));
        sink.sample(&sample(2.0));
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> =
            out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["pid"], 1234);
        assert_eq!(lines[0]["tid"], 5678);
        assert_eq!(lines[0]["latency_ms"], 1.5);
    }

    #[test]
    fn test_stats_sink_aggregates() {
        let mut sink = StatsSink::new(TextSink::new(Vec::new()));
        sink.sample(&sample(2.0));
        sink.sample(&sample(4.0));
        sink.sample(&sample(9.0));
        sink.diagnostic(&Diagnostic::SamplesDropped(7));
        sink.diagnostic(&Diagnostic::MalformedRecord(DecodeError::WrongLength {
            len: 3,
            expected: 16,
        }));

        let stats = *sink.stats();
        assert_eq!(stats.count, 3);
        assert!((stats.min_ms - 2.0).abs() < f64::EPSILON);
        assert!((stats.max_ms - 9.0).abs() < f64::EPSILON);
        assert!((stats.mean_ms().unwrap() - 5.0).abs() < f64::EPSILON);
        assert_eq!(stats.dropped, 7);
        assert_eq!(stats.malformed, 1);
        assert_eq!(
            stats.to_string(),
            "3 calls, min 2.000 ms, mean 5.000 ms, max 9.000 ms (7 dropped, 1 malformed)"
        );
    }

    #[test]
    fn test_empty_stats_display() {
        assert_eq!(LatencyStats::default().to_string(), "0 calls (0 dropped, 0 malformed)");
    }
}
