//! Logical stream clock.
//!
//! The watermark is derived from observed event timestamps rather than wall
//! clock time, so replaying historical logs still produces correct relative
//! timeouts. It never recedes.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Monotonic watermark shared by every ingestion path.
#[derive(Debug)]
pub struct StreamClock {
    watermark_us: AtomicI64,
}

impl StreamClock {
    /// Create a clock starting at the unix epoch.
    pub fn new() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            watermark_us: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Move the watermark to `max(watermark, ts)` and return the result.
    ///
    /// The returned value already includes `ts`, even when other threads
    /// advance the clock concurrently.
    pub fn advance(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ts_us = ts.timestamp_micros();
        let prev = self.watermark_us.fetch_max(ts_us, Ordering::AcqRel);
        from_micros(prev.max(ts_us))
    }

    /// Current watermark.
    pub fn current(&self) -> DateTime<Utc> {
        from_micros(self.watermark_us.load(Ordering::Acquire))
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
