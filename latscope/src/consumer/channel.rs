//! Read side of the bounded kernel → userspace event channel
//!
//! A [`Batch`] is everything readable at one wake-up: zero or more raw
//! records plus the number of records the kernel dropped since the previous
//! read. Closing goes through a [`ChannelCloser`], which may be called from
//! another task while a read is pending; the pending read then returns
//! [`ChannelError::Closed`].

use aya::maps::{MapData, PerCpuArray, RingBuf};
use log::warn;
use std::io;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use crate::domain::ChannelError;

/// Records available at one wake-up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Raw record payloads in arrival order
    pub records: Vec<Vec<u8>>,
    /// Records dropped by the producer since the previous read
    pub lost: u64,
}

/// Handle that closes a channel from outside the read loop
#[derive(Debug, Clone)]
pub struct ChannelCloser(Arc<watch::Sender<bool>>);

impl ChannelCloser {
    /// Mark the channel closed; returns `true` only for the first call
    pub fn close(&self) -> bool {
        !self.0.send_replace(true)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// Create a closer and the receiver a channel implementation waits on
#[must_use]
pub fn close_signal() -> (ChannelCloser, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ChannelCloser(Arc::new(tx)), rx)
}

/// Resolve once `closed` has been set (or its closer dropped)
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // Err means every closer is gone, which also ends the channel
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Single-reader event channel
#[allow(async_fn_in_trait)]
pub trait EventChannel {
    /// Wait for the next batch
    ///
    /// # Errors
    /// - [`ChannelError::Closed`] once closed (expected shutdown path)
    /// - [`ChannelError::Transient`] for a failed read that may succeed later
    /// - [`ChannelError::Unreadable`] when no further read can succeed
    async fn read_batch(&mut self) -> Result<Batch, ChannelError>;

    /// Handle for closing this channel from another task
    fn closer(&self) -> ChannelCloser;
}

/// [`EventChannel`] over the aya `EVENTS` ring buffer and `DROPPED` counter
pub struct RingBufChannel {
    ring: AsyncFd<RingBuf<MapData>>,
    dropped: PerCpuArray<MapData, u64>,
    dropped_seen: u64,
    closed: watch::Receiver<bool>,
    closer: ChannelCloser,
}

impl RingBufChannel {
    /// Wrap the ring buffer for async readiness
    ///
    /// # Errors
    /// Returns an error if the ring buffer fd cannot be registered with tokio
    #[allow(unsafe_code)]
    pub fn new(ring: RingBuf<MapData>, dropped: PerCpuArray<MapData, u64>) -> io::Result<Self> {
        let (closer, closed) = close_signal();
        // SAFETY: the RingBuf owns its map fd and moves into the AsyncFd, so
        // the fd stays open and unchanged until the AsyncFd is dropped
        let ring = unsafe { AsyncFd::register(ring) }?;
        Ok(Self { ring, dropped, dropped_seen: 0, closed, closer })
    }

    /// Drops counted by all CPUs since the previous call
    ///
    /// A failed counter read reports 0 rather than discarding the records
    /// already drained; the delta is picked up on the next read.
    fn lost_since_last_read(&mut self) -> u64 {
        match self.dropped.get(&0, 0) {
            Ok(values) => lost_delta(&mut self.dropped_seen, values.iter().sum()),
            Err(e) => {
                warn!("Failed to read drop counter: {e}");
                0
            }
        }
    }
}

/// Advance `seen` to `total`, returning the drops in between
///
/// The counter is free-running, so the difference wraps with it.
fn lost_delta(seen: &mut u64, total: u64) -> u64 {
    let lost = total.wrapping_sub(*seen);
    *seen = total;
    lost
}

impl EventChannel for RingBufChannel {
    async fn read_batch(&mut self) -> Result<Batch, ChannelError> {
        let records = tokio::select! {
            biased;
            () = wait_closed(&mut self.closed) => return Err(ChannelError::Closed),
            ready = self.ring.readable_mut() => {
                let mut guard = ready?;
                let ring = guard.get_inner_mut();
                let mut records = Vec::new();
                while let Some(item) = ring.next() {
                    records.push(item.to_vec());
                }
                guard.clear_ready();
                records
            }
        };

        let lost = self.lost_since_last_read();
        Ok(Batch { records, lost })
    }

    fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reports_first_call_only() {
        let (closer, rx) = close_signal();
        assert!(!closer.is_closed());
        assert!(closer.close());
        assert!(!closer.clone().close());
        assert!(*rx.borrow());
    }

    #[test]
    fn test_lost_delta_counts_only_new_drops() {
        let mut seen = 0;
        assert_eq!(lost_delta(&mut seen, 5), 5);
        assert_eq!(lost_delta(&mut seen, 12), 7);
        assert_eq!(lost_delta(&mut seen, 12), 0);
        assert_eq!(seen, 12);
    }

    #[test]
    fn test_lost_delta_across_counter_wrap() {
        let mut seen = u64::MAX - 1;
        assert_eq!(lost_delta(&mut seen, 2), 4);
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_wait_closed_wakes_pending_waiter() {
        let (closer, mut rx) = close_signal();
        let waiter = tokio::spawn(async move { wait_closed(&mut rx).await });
        tokio::task::yield_now().await;
        closer.close();
        waiter.await.unwrap();
    }
}
