//! Worker pool feeding raw lines into a shared [`LogJoin`]
//!
//! Each worker owns a bounded queue. Lines are routed by a hash of their user
//! id, so one user's lines are inserted in submission order and conflicting
//! attributes resolve the same way on every replay. Lines without a usable
//! user id cannot touch a session and go round-robin.
//!
//! # Example
//! ```ignore
//! let pool = IngestPool::new(IngestPoolConfig::default(), join.clone());
//! pool.submit(IngestLine::new("shop", line, None)).await?;
//! pool.shutdown().await;
//! ```

use crate::event::uid_of;
use crate::join::LogJoin;
use chrono::{DateTime, Utc};
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for an ingest pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestPoolConfig {
    /// Pool name for identification
    pub name: String,
    /// Number of worker tasks
    pub workers: usize,
    /// Maximum queue size per worker
    pub queue_size: usize,
    /// Backpressure strategy when a queue is full
    pub backpressure: BackpressureStrategy,
}

impl Default for IngestPoolConfig {
    fn default() -> Self {
        Self {
            name: "ingest".to_string(),
            workers: 4,
            queue_size: 1000,
            backpressure: BackpressureStrategy::Block,
        }
    }
}

/// Strategy for handling backpressure when a queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Wait until the queue has room
    #[default]
    Block,
    /// Drop the incoming line
    DropNewest,
    /// Return an error to the caller
    Error,
}

/// Returned by [`IngestPool::submit`] when a line cannot be queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackpressureError {
    #[error("Pool '{pool_name}' queue full (depth: {queue_depth})")]
    QueueFull {
        pool_name: String,
        queue_depth: usize,
    },
    #[error("Pool '{0}' is shut down")]
    Closed(String),
}

/// A raw line waiting to be joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestLine {
    pub tenant: String,
    pub line: String,
    pub time: Option<DateTime<Utc>>,
}

impl IngestLine {
    pub fn new(tenant: impl Into<String>, line: impl Into<String>, time: Option<DateTime<Utc>>) -> Self {
        Self {
            tenant: tenant.into(),
            line: line.into(),
            time,
        }
    }
}

/// Counters for an ingest pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestPoolMetrics {
    /// Lines accepted into a queue
    pub submitted: u64,
    /// Lines dropped due to backpressure
    pub dropped: u64,
    /// Lines handed to the join
    pub processed: u64,
    /// Lines the decoder rejected
    pub invalid: u64,
    /// Lines currently queued
    pub queue_depth: usize,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    invalid: AtomicU64,
}

/// A fixed set of workers inserting lines into one join.
pub struct IngestPool {
    config: IngestPoolConfig,
    senders: Vec<mpsc::Sender<IngestLine>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    counters: Arc<PoolCounters>,
}

impl IngestPool {
    /// Spawn `config.workers` workers, each with its own bounded queue.
    pub fn new(config: IngestPoolConfig, join: Arc<LogJoin>) -> Self {
        let workers = config.workers.max(1);
        let queue_size = config.queue_size.max(1);
        let counters = Arc::new(PoolCounters::default());

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size);
            senders.push(tx);
            handles.push(tokio::spawn(Self::worker_task(
                id,
                config.name.clone(),
                rx,
                join.clone(),
                counters.clone(),
            )));
        }

        info!(
            "Ingest pool '{}' started with {} workers",
            config.name, workers
        );

        Self {
            config: IngestPoolConfig {
                workers,
                queue_size,
                ..config
            },
            senders,
            handles,
            next: AtomicUsize::new(0),
            counters,
        }
    }

    async fn worker_task(
        id: usize,
        pool_name: String,
        mut rx: mpsc::Receiver<IngestLine>,
        join: Arc<LogJoin>,
        counters: Arc<PoolCounters>,
    ) {
        while let Some(item) = rx.recv().await {
            if join
                .insert_logline(&item.tenant, &item.line, item.time)
                .await
                .is_err()
            {
                counters.invalid.fetch_add(1, Ordering::Relaxed);
            }
            counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Pool '{}' worker {} stopped", pool_name, id);
    }

    pub fn config(&self) -> &IngestPoolConfig {
        &self.config
    }

    /// Worker owning the user of `line`.
    fn route(&self, line: &str) -> usize {
        let workers = self.senders.len();
        match uid_of(line) {
            Some(uid) => {
                let mut hasher = FxHasher::default();
                uid.hash(&mut hasher);
                (hasher.finish() % workers as u64) as usize
            }
            None => self.next.fetch_add(1, Ordering::Relaxed) % workers,
        }
    }

    /// Queue a line on the worker owning its user.
    pub async fn submit(&self, line: IngestLine) -> Result<(), BackpressureError> {
        let worker = self.route(&line.line);
        let tx = &self.senders[worker];

        match self.config.backpressure {
            BackpressureStrategy::Block => {
                if tx.send(line).await.is_err() {
                    warn!("Pool '{}' worker {} channel closed", self.config.name, worker);
                    return Err(BackpressureError::Closed(self.config.name.clone()));
                }
            }
            BackpressureStrategy::DropNewest => match tx.try_send(line) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Pool '{}' dropped line (queue full)", self.config.name);
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(BackpressureError::Closed(self.config.name.clone()));
                }
            },
            BackpressureStrategy::Error => match tx.try_send(line) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(BackpressureError::QueueFull {
                        pool_name: self.config.name.clone(),
                        queue_depth: self.queue_depth(),
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(BackpressureError::Closed(self.config.name.clone()));
                }
            },
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lines queued across all workers.
    pub fn queue_depth(&self) -> usize {
        self.senders
            .iter()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .sum()
    }

    pub fn metrics(&self) -> IngestPoolMetrics {
        IngestPoolMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
        }
    }

    /// Close every queue and wait until the workers have drained them.
    pub async fn shutdown(self) -> IngestPoolMetrics {
        let IngestPool {
            config,
            senders,
            handles,
            counters,
            ..
        } = self;
        drop(senders);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Pool '{}' worker failed: {}", config.name, e);
            }
        }
        info!("Ingest pool '{}' shut down", config.name);

        IngestPoolMetrics {
            submitted: counters.submitted.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            invalid: counters.invalid.load(Ordering::Relaxed),
            queue_depth: 0,
        }
    }
}
