//! # Event Consumer
//!
//! Owns the read side of the event channel and turns raw records into
//! [`LatencySample`]s for a [`LatencySink`].
//!
//! ## Per Read
//!
//! 1. Closed channel → return (orderly shutdown)
//! 2. Lost records → one [`Diagnostic::SamplesDropped`]
//! 3. Each record → decode, or [`Diagnostic::MalformedRecord`] and skip
//! 4. Decoded record → ns to ms, key to PID/TID, forward to the sink
//!
//! Records are forwarded in the order the channel yields them and never
//! held past the read they arrived in.

pub mod channel;
pub mod record;
pub mod sink;

pub use channel::{Batch, ChannelCloser, EventChannel, RingBufChannel};
pub use record::{LatencyRecord, LatencySample};
pub use sink::{Diagnostic, JsonSink, LatencySink, LatencyStats, StatsSink, TextSink};

use log::{debug, error};
use std::time::Duration;

use crate::domain::ChannelError;

/// Consecutive failed reads after which the channel is considered gone
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

/// Pause between a failed read and the retry
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Counters for one consumer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub batches: u64,
    pub samples: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub read_errors: u64,
}

/// Read until the channel is closed
///
/// Lost and malformed records are reported to the sink and skipped; a failed
/// read is reported and retried. The sink's `finish` runs on every return.
///
/// # Errors
/// [`ChannelError::Unreadable`] when the channel reports it, or after
/// repeated consecutive read failures
pub async fn run<C, S>(channel: &mut C, sink: &mut S) -> Result<ConsumerReport, ChannelError>
where
    C: EventChannel,
    S: LatencySink + ?Sized,
{
    let result = consume(channel, sink).await;
    sink.finish();
    result
}

async fn consume<C, S>(channel: &mut C, sink: &mut S) -> Result<ConsumerReport, ChannelError>
where
    C: EventChannel,
    S: LatencySink + ?Sized,
{
    let mut report = ConsumerReport::default();
    let mut consecutive_errors = 0;

    loop {
        let batch = match channel.read_batch().await {
            Ok(batch) => {
                consecutive_errors = 0;
                batch
            }
            Err(ChannelError::Closed) => {
                debug!("Event channel closed after {} samples", report.samples);
                return Ok(report);
            }
            Err(ChannelError::Transient(e)) => {
                report.read_errors += 1;
                consecutive_errors += 1;
                sink.diagnostic(&Diagnostic::ReadError(e.to_string()));
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    error!("Giving up after {consecutive_errors} consecutive read errors");
                    return Err(ChannelError::Unreadable(e.to_string()));
                }
                tokio::time::sleep(READ_RETRY_DELAY).await;
                continue;
            }
            Err(e @ ChannelError::Unreadable(_)) => return Err(e),
        };

        report.batches += 1;

        if batch.lost > 0 {
            report.dropped += batch.lost;
            sink.diagnostic(&Diagnostic::SamplesDropped(batch.lost));
        }

        for raw in &batch.records {
            match LatencyRecord::decode(raw) {
                Ok(record) => {
                    report.samples += 1;
                    sink.sample(&record.to_sample());
                }
                Err(reason) => {
                    report.malformed += 1;
                    sink.diagnostic(&Diagnostic::MalformedRecord(reason));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_record, RecordingSink, ScriptedChannel};
    use std::io;

    #[tokio::test]
    async fn test_forwards_all_records_in_order() {
        let records = (1..=5).map(|i| encode_record(1234, 5678 + i, u64::from(i) * 1_000_000));
        let mut channel = ScriptedChannel::new(vec![Ok(Batch { records: records.collect(), lost: 0 })]);
        channel.close_when_drained();
        let mut sink = RecordingSink::default();

        let report = run(&mut channel, &mut sink).await.unwrap();

        assert_eq!(report.samples, 5);
        let tids: Vec<u32> = sink.samples.iter().map(|s| s.tid).collect();
        assert_eq!(tids, vec![5679, 5680, 5681, 5682, 5683]);
        assert!(sink.diagnostics.is_empty());
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_lost_only_batch_emits_one_diagnostic() {
        let mut channel = ScriptedChannel::new(vec![Ok(Batch { records: vec![], lost: 17 })]);
        let mut sink = RecordingSink::default();
        channel.close_when_drained();

        let report = run(&mut channel, &mut sink).await.unwrap();

        assert!(sink.samples.is_empty());
        assert_eq!(sink.diagnostics, vec![Diagnostic::SamplesDropped(17)]);
        assert_eq!(report.dropped, 17);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_stop_the_loop() {
        let batch = Batch {
            records: vec![encode_record(1, 2, 3_000_000), vec![0xff; 5], encode_record(1, 3, 4_000_000)],
            lost: 0,
        };
        let mut channel = ScriptedChannel::new(vec![Ok(batch)]);
        channel.close_when_drained();
        let mut sink = RecordingSink::default();

        let report = run(&mut channel, &mut sink).await.unwrap();

        assert_eq!(report.samples, 2);
        assert_eq!(report.malformed, 1);
        assert!(matches!(sink.diagnostics[..], [Diagnostic::MalformedRecord(_)]));
        assert_eq!(sink.samples[1].tid, 3);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let mut channel = ScriptedChannel::new(vec![
            Err(ChannelError::Transient(io::Error::other("EINTR"))),
            Ok(Batch { records: vec![encode_record(7, 8, 5_000_000)], lost: 0 }),
        ]);
        channel.close_when_drained();
        let mut sink = RecordingSink::default();

        let report = run(&mut channel, &mut sink).await.unwrap();

        assert_eq!(report.read_errors, 1);
        assert_eq!(sink.samples.len(), 1);
        assert!((sink.samples[0].latency_ms - 5.0).abs() < f64::EPSILON);
        assert_eq!((sink.samples[0].pid, sink.samples[0].tid), (7, 8));
    }

    #[tokio::test]
    async fn test_persistent_errors_end_the_loop() {
        let script = (0..MAX_CONSECUTIVE_READ_ERRORS)
            .map(|_| Err(ChannelError::Transient(io::Error::other("EIO"))))
            .collect();
        let mut channel = ScriptedChannel::new(script);
        let mut sink = RecordingSink::default();

        let err = run(&mut channel, &mut sink).await.unwrap_err();

        assert!(matches!(err, ChannelError::Unreadable(_)));
        assert!(sink.finished);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let mut channel = ScriptedChannel::new(vec![]);
        let closer = channel.closer();
        let mut sink = RecordingSink::default();

        let signal = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close()
        });
        let report = run(&mut channel, &mut sink).await.unwrap();

        assert!(signal.await.unwrap());
        assert_eq!(report, ConsumerReport::default());
    }
}
