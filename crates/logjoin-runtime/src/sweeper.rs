//! Periodic flush task
//!
//! Sessions of users who stop sending traffic are only evaluated by a flush
//! pass over the registry. The sweeper runs one such pass on every tick.

use crate::join::LogJoin;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time between two flush passes.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Advance the stream clock to wall clock time before each pass. Only
    /// appropriate for live traffic, never for replays of old logs.
    pub advance_to_wall_clock: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            advance_to_wall_clock: false,
        }
    }
}

/// Spawn a task that flushes `join` every `config.interval`.
///
/// The first pass happens one full interval after spawning.
pub fn spawn_sweeper(join: Arc<LogJoin>, config: SweepConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = if config.interval.is_zero() {
            warn!("sweep interval of zero requested, using 1s");
            Duration::from_secs(1)
        } else {
            config.interval
        };
        debug!("Sweeper starting with interval: {:?}", interval);

        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if config.advance_to_wall_clock {
                join.advance_clock(Utc::now());
            }
            let report = join.sweep().await;
            debug!(
                "Sweep done: {} queries, {} sessions",
                report.queries_flushed, report.sessions_flushed
            );
        }
    })
}

/// Owns the sweeper task; aborts it when stopped or dropped.
#[derive(Default)]
pub struct Sweeper {
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start sweeping `join`. A sweeper that is already running is replaced.
    pub fn start(&mut self, join: Arc<LogJoin>, config: SweepConfig) {
        self.stop();
        info!("Starting sweeper every {:?}", config.interval);
        self.handle = Some(spawn_sweeper(join, config));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::JoinConfig;
    use crate::sink::MemorySink;
    use chrono::{DateTime, Duration as ChronoDuration};

    #[tokio::test]
    async fn test_sweeper_flushes_idle_sessions() {
        let sink = Arc::new(MemorySink::new());
        let join = Arc::new(LogJoin::new(JoinConfig::default(), sink.clone()));
        join.insert_logline(
            "shop",
            "c=u1~q1&e=q",
            Some(DateTime::<Utc>::UNIX_EPOCH),
        )
        .await
        .unwrap();
        join.advance_clock(DateTime::<Utc>::UNIX_EPOCH + ChronoDuration::seconds(2_000));

        let mut sweeper = Sweeper::new();
        sweeper.start(
            join.clone(),
            SweepConfig {
                interval: Duration::from_millis(20),
                advance_to_wall_clock: false,
            },
        );
        assert!(sweeper.is_running());
        assert_eq!(join.num_sessions(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(join.num_sessions(), 0);
        assert_eq!(sink.sessions().len(), 1);

        sweeper.stop();
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn test_sweeper_without_clock_advance_keeps_sessions() {
        let sink = Arc::new(MemorySink::new());
        let join = Arc::new(LogJoin::new(JoinConfig::default(), sink.clone()));
        join.insert_logline(
            "shop",
            "c=u1~q1&e=q",
            Some(DateTime::<Utc>::UNIX_EPOCH),
        )
        .await
        .unwrap();

        let _handle = spawn_sweeper(join.clone(), SweepConfig {
            interval: Duration::from_millis(10),
            advance_to_wall_clock: false,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(join.num_sessions(), 1);
        assert!(sink.is_empty());
    }
}
