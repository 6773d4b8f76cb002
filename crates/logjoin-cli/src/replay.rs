//! Replay of recorded pixel logs through the join
//!
//! Input files hold one line per pixel request, either a bare query string or
//! `<tenant>\t<unix seconds>\t<query string>`. Blank lines and lines starting
//! with `#` are skipped.

use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use logjoin_runtime::{
    Attributes, ConsoleSink, DeadLetterQueue, FeatureCache, IngestLine, IngestPool,
    IngestPoolMetrics, ItemRef, JoinMetrics, JoinSink, JoinStats, JsonLinesSink, LogJoin,
    StaticFeatureStore, Sweeper,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Malformed replay input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("expected 3 tab separated fields, got {0}")]
    FieldCount(usize),

    #[error("invalid unix timestamp '{0}'")]
    Timestamp(String),
}

/// One line of replay input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLine<'a> {
    pub tenant: Option<&'a str>,
    pub time: Option<DateTime<Utc>>,
    pub query: &'a str,
}

/// Split a replay line into tenant, timestamp and query string.
///
/// Returns `Ok(None)` for lines that carry nothing to join.
pub fn parse_input_line(line: &str) -> Result<Option<InputLine<'_>>, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if !line.contains('\t') {
        return Ok(Some(InputLine {
            tenant: None,
            time: None,
            query: line.trim(),
        }));
    }

    let fields: Vec<&str> = line.splitn(3, '\t').collect();
    let (tenant, secs, query) = match fields.as_slice() {
        [tenant, secs, query] => (*tenant, *secs, *query),
        _ => return Err(InputError::FieldCount(fields.len())),
    };
    let time = secs
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .ok_or_else(|| InputError::Timestamp(secs.to_string()))?;

    Ok(Some(InputLine {
        tenant: Some(tenant.trim()).filter(|t| !t.is_empty()),
        time: Some(time),
        query: query.trim(),
    }))
}

/// Per-run settings that do not live in the config file.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub file: PathBuf,
    /// Overrides `join.default_tenant`
    pub tenant: Option<String>,
    /// Overrides `ingest.workers`; one worker replays inline
    pub workers: Option<usize>,
    /// Force out every open session at the end of the input
    pub drain: bool,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub lines_read: u64,
    pub lines_skipped: u64,
    pub pool: Option<IngestPoolMetrics>,
    pub stats: JoinStats,
    pub elapsed: Duration,
}

impl ReplaySummary {
    pub fn print(&self) {
        println!("\nReplay Statistics:");
        println!("   Lines read:          {}", self.lines_read);
        println!("   Lines skipped:       {}", self.lines_skipped);
        println!("   Loglines joined:     {}", self.stats.loglines_total);
        println!("   Loglines invalid:    {}", self.stats.loglines_invalid);
        println!("   Late events dropped: {}", self.stats.late_events_dropped);
        println!("   Joined queries:      {}", self.stats.joined_queries);
        println!("   Joined item visits:  {}", self.stats.joined_item_visits);
        println!("   Joined sessions:     {}", self.stats.joined_sessions);
        println!("   Open sessions:       {}", self.stats.active_sessions);
        println!("   Feature cache size:  {}", self.stats.cache_size);
        if let Some(pool) = &self.pool {
            println!("   Dropped by pool:     {}", pool.dropped);
        }
        println!("   Runtime: {:.1}s", self.elapsed.as_secs_f64());
    }
}

#[derive(Deserialize)]
struct FeatureRow {
    tenant: String,
    item: String,
    features: Attributes,
}

/// Load a JSON lines feature table into a static store.
pub fn load_feature_table(path: &Path) -> Result<StaticFeatureStore> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read feature table {}", path.display()))?;

    let mut store = StaticFeatureStore::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: FeatureRow = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid feature row", path.display(), n + 1))?;
        match ItemRef::parse(&row.item) {
            Some(item) => store = store.with_item(&row.tenant, item, row.features),
            None => warn!("{}:{}: invalid item '{}'", path.display(), n + 1, row.item),
        }
    }
    Ok(store)
}

fn build_sink(config: &Config) -> Result<Arc<dyn JoinSink>> {
    Ok(match &config.output.path {
        Some(path) => Arc::new(
            JsonLinesSink::new("output", path)
                .with_context(|| format!("failed to open output {}", path.display()))?,
        ),
        None if config.output.pretty => Arc::new(ConsoleSink::new("console").pretty()),
        None => Arc::new(ConsoleSink::new("console")),
    })
}

/// Build a join service from `config`.
pub fn build_join(config: &Config) -> Result<LogJoin> {
    let mut join = LogJoin::new(config.join_config(), build_sink(config)?);

    if let Some(path) = &config.output.dead_letter_path {
        let dlq = DeadLetterQueue::open(path)
            .with_context(|| format!("failed to open dead letter file {}", path.display()))?;
        join = join.with_dead_letter(dlq);
    }
    if config.metrics.enabled {
        join = join.with_metrics(JoinMetrics::new());
    }
    if config.join.enable_cache {
        let store = match &config.feature_cache.path {
            Some(path) => load_feature_table(path)?,
            None => {
                warn!("enable_cache is set but no feature_cache.path is configured");
                StaticFeatureStore::new()
            }
        };
        let cache = FeatureCache::new(
            Arc::new(store),
            Duration::from_secs(config.feature_cache.ttl_secs),
        )
        .with_max_entries(config.feature_cache.max_entries);
        join = join.with_feature_cache(cache);
    }
    Ok(join)
}

/// Feed every line of `options.file` through a join built from `config`.
pub async fn run_replay(config: &Config, options: &ReplayOptions) -> Result<ReplaySummary> {
    let start = Instant::now();
    let join = Arc::new(build_join(config)?);
    let default_tenant = options
        .tenant
        .clone()
        .unwrap_or_else(|| config.join.default_tenant.clone());

    let mut sweeper = Sweeper::new();
    if config.sweep.enabled {
        sweeper.start(join.clone(), config.sweep_config());
    }

    let workers = options.workers.unwrap_or(config.ingest.workers).max(1);
    let pool = (workers > 1).then(|| {
        let mut pool_config = config.ingest_config();
        pool_config.workers = workers;
        IngestPool::new(pool_config, join.clone())
    });

    info!(
        "Replaying {} with {} worker(s)",
        options.file.display(),
        workers
    );

    let file = tokio::fs::File::open(&options.file)
        .await
        .with_context(|| format!("failed to open {}", options.file.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut summary = ReplaySummary::default();

    while let Some(raw) = lines.next_line().await? {
        summary.lines_read += 1;
        let input = match parse_input_line(&raw) {
            Ok(Some(input)) => input,
            Ok(None) => {
                summary.lines_skipped += 1;
                continue;
            }
            Err(e) => {
                warn!("line {}: {}", summary.lines_read, e);
                summary.lines_skipped += 1;
                continue;
            }
        };
        let tenant = input.tenant.unwrap_or(default_tenant.as_str());

        match &pool {
            Some(pool) => {
                if let Err(e) = pool
                    .submit(IngestLine::new(tenant, input.query, input.time))
                    .await
                {
                    warn!("line {}: {}", summary.lines_read, e);
                }
            }
            None => {
                // Rejections are already counted and logged by the join
                let _ = join.insert_logline(tenant, input.query, input.time).await;
            }
        }
    }

    if let Some(pool) = pool {
        summary.pool = Some(pool.shutdown().await);
    }
    sweeper.stop();

    if options.drain {
        join.drain().await;
    } else {
        join.sweep().await;
    }

    if let Some(path) = &config.metrics.stats_path {
        join.export_stats(path)
            .with_context(|| format!("failed to write stats to {}", path.display()))?;
        info!("Stats written to {}", path.display());
    }

    summary.stats = join.stats();
    summary.elapsed = start.elapsed();
    Ok(summary)
}
