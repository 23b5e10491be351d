use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TransferError};

/// Bandwidth limiter for the outgoing byte stream.
///
/// Throughput is measured from the moment the limiter is created, not per
/// call: after each chunk the limiter sleeps for however long the sender is
/// ahead of `bytes_per_sec`.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    started: Instant,
    transferred: u64,
}

impl Throttle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            started: Instant::now(),
            transferred: 0,
        }
    }

    /// Limiter for a speed limit expressed in KB/s
    pub fn from_kbs(kbs: u64) -> Self {
        Self::new(kbs.saturating_mul(1024))
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// How long the stream must pause after `transferred` bytes at `elapsed`
    fn delay_for(&self, elapsed: Duration) -> Duration {
        let expected = Duration::from_secs_f64(self.transferred as f64 / self.bytes_per_sec as f64);
        expected.saturating_sub(elapsed)
    }

    /// Account for `n` bytes just sent and sleep off any excess.
    pub async fn consume(&mut self, n: usize, cancel: &CancellationToken) -> Result<()> {
        self.transferred += n as u64;
        let delay = self.delay_for(self.started.elapsed());
        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }
}
