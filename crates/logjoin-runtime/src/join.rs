//! The log join service.
//!
//! Data flow for every line: decode, advance the stream clock, find or create
//! the user's session, merge, evaluate the flush policy for that session.
//! Records are queued on an outbox while the deciding session lock is held,
//! so outbox order is decision order. The outbox is drained into the sink by
//! one task at a time, after every registry and session lock is released.

use crate::clock::StreamClock;
use crate::dead_letter::DeadLetterQueue;
use crate::error::JoinError;
use crate::event::{decode, EventKind, LogEvent};
use crate::features::FeatureCache;
use crate::flush::{FlushDecision, FlushPolicy};
use crate::metrics::JoinMetrics;
use crate::record::{JoinedItemVisit, JoinedQuery, JoinedSession};
use crate::registry::SessionRegistry;
use crate::session::MergeOutcome;
use crate::sink::JoinSink;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Runtime switches for the join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinConfig {
    pub policy: FlushPolicy,
    /// Run every decision but never call the sink.
    pub dry_run: bool,
    /// Enrich item visits through the attached feature cache.
    pub enable_cache: bool,
}

/// What happened to one inserted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertReport {
    pub merge: MergeOutcome,
    pub queries_flushed: usize,
    pub session_flushed: bool,
    /// Watermark used for the flush decision.
    pub stream_time: DateTime<Utc>,
}

/// Outcome of a flush pass over the whole registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub queries_flushed: usize,
    pub sessions_flushed: usize,
}

/// Point-in-time counters of the join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    pub loglines_total: u64,
    pub loglines_invalid: u64,
    pub late_events_dropped: u64,
    pub joined_sessions: u64,
    pub joined_queries: u64,
    pub joined_item_visits: u64,
    pub active_sessions: usize,
    pub cache_size: usize,
}

#[derive(Default)]
struct JoinCounters {
    loglines_total: AtomicU64,
    loglines_invalid: AtomicU64,
    late_events_dropped: AtomicU64,
    joined_sessions: AtomicU64,
    joined_queries: AtomicU64,
    joined_item_visits: AtomicU64,
}

enum Emission {
    Query(JoinedQuery),
    ItemVisit(JoinedItemVisit),
    Session(JoinedSession),
}

type Outbox = VecDeque<Emission>;

/// Queries first, then the session record that closes them out.
fn push_decision(outbox: &mut Outbox, decision: FlushDecision) {
    outbox.extend(decision.queries.into_iter().map(Emission::Query));
    if let Some(session) = decision.session {
        outbox.push_back(Emission::Session(session));
    }
}

/// Correlates pixel events per user and emits joined records.
pub struct LogJoin {
    config: JoinConfig,
    clock: StreamClock,
    registry: SessionRegistry,
    sink: Arc<dyn JoinSink>,
    features: Option<FeatureCache>,
    dead_letter: Option<DeadLetterQueue>,
    metrics: Option<JoinMetrics>,
    counters: JoinCounters,
    outbox: Mutex<Outbox>,
    /// Held while draining the outbox; serializes sink calls.
    delivery: tokio::sync::Mutex<()>,
}

impl LogJoin {
    pub fn new(config: JoinConfig, sink: Arc<dyn JoinSink>) -> Self {
        Self {
            config,
            clock: StreamClock::new(),
            registry: SessionRegistry::new(),
            sink,
            features: None,
            dead_letter: None,
            metrics: None,
            counters: JoinCounters::default(),
            outbox: Mutex::new(Outbox::new()),
            delivery: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_feature_cache(mut self, cache: FeatureCache) -> Self {
        self.features = Some(cache);
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterQueue) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn with_metrics(mut self, metrics: JoinMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &JoinConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&JoinMetrics> {
        self.metrics.as_ref()
    }

    /// Decode and insert one raw pixel line.
    ///
    /// Decoding errors are counted, logged and dead-lettered, then returned
    /// to the caller; no session is touched in that case.
    pub async fn insert_logline(
        &self,
        tenant: &str,
        line: &str,
        time: Option<DateTime<Utc>>,
    ) -> Result<InsertReport, JoinError> {
        self.counters.loglines_total.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.loglines_total.inc();
        }

        match decode(tenant, line, time) {
            Ok(event) => Ok(self.insert_event(event).await),
            Err(e) => {
                self.reject(tenant, line, &e);
                Err(e)
            }
        }
    }

    /// Insert an already decoded event.
    pub async fn insert_event(&self, event: LogEvent) -> InsertReport {
        let stream_time = self.clock.advance(event.time);
        let policy = self.config.policy;
        let tenant = event.tenant.clone();
        let uid = event.uid.clone();
        let event_id = event.event_id.clone();
        let kind = event.kind.name();
        let is_visit = matches!(event.kind, EventKind::ItemVisit(_));

        let (merge, queries_flushed, session_flushed) =
            self.registry.with_session(&tenant, &uid, |session| {
                let merge = session.merge(event);
                let visit = match merge {
                    MergeOutcome::Inserted if is_visit => session
                        .item_visits
                        .get(&event_id)
                        .map(|v| v.to_joined(&session.tenant, &uid, &event_id)),
                    _ => None,
                };
                let decision = policy.evaluate(&uid, session, stream_time);
                let counts = (merge, decision.queries.len(), decision.session_flushed());

                let mut outbox = self.lock_outbox();
                if let Some(visit) = visit {
                    outbox.push_back(Emission::ItemVisit(visit));
                }
                push_decision(&mut outbox, decision);
                counts
            });
        debug!("{} {}~{} for {}: {:?}", kind, uid, event_id, tenant, merge);

        if session_flushed {
            self.registry.remove(&uid);
        }
        if merge == MergeOutcome::DroppedFlushed {
            self.counters
                .late_events_dropped
                .fetch_add(1, Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.late_events_dropped.inc();
            }
        }

        self.deliver().await;
        self.observe(stream_time);

        InsertReport {
            merge,
            queries_flushed,
            session_flushed,
            stream_time,
        }
    }

    /// Evaluate every session against `stream_time`.
    ///
    /// Holds the registry lock for the whole pass, so session creation waits
    /// until the pass is over. Sink calls happen after the lock is released.
    pub async fn flush(&self, stream_time: DateTime<Utc>) -> FlushReport {
        let policy = self.config.policy;
        let mut report = FlushReport::default();

        self.registry.for_each_session(|uid, session| {
            let decision = policy.evaluate(uid, session, stream_time);
            let done = decision.session_flushed();
            report.queries_flushed += decision.queries.len();
            report.sessions_flushed += usize::from(done);
            push_decision(&mut self.lock_outbox(), decision);
            done
        });

        info!(
            "flush stream_time={} active_sessions={} queries_flushed={} sessions_flushed={}",
            stream_time,
            self.registry.len(),
            report.queries_flushed,
            report.sessions_flushed
        );

        self.deliver().await;
        self.observe(stream_time);
        report
    }

    /// Flush pass at the current watermark.
    pub async fn sweep(&self) -> FlushReport {
        self.flush(self.clock.current()).await
    }

    /// Force out every open query and session, e.g. at the end of a replay.
    pub async fn drain(&self) -> FlushReport {
        let policy = self.config.policy;
        let mut report = FlushReport::default();

        self.registry.for_each_session(|uid, session| {
            let decision = policy.force(uid, session);
            report.queries_flushed += decision.queries.len();
            report.sessions_flushed += usize::from(decision.session_flushed());
            push_decision(&mut self.lock_outbox(), decision);
            true
        });

        info!(
            "drained {} sessions and {} queries",
            report.sessions_flushed, report.queries_flushed
        );

        self.deliver().await;
        if let Err(e) = self.sink.flush().await {
            error!("Sink {} flush error: {}", self.sink.name(), e);
        }
        self.observe(self.clock.current());
        report
    }

    /// Advance the stream clock without inserting an event.
    pub fn advance_clock(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.clock.advance(ts)
    }

    pub fn stream_time(&self) -> DateTime<Utc> {
        self.clock.current()
    }

    pub fn num_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn has_session(&self, uid: &str) -> bool {
        self.registry.contains(uid)
    }

    pub fn cache_size(&self) -> usize {
        self.features.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> JoinStats {
        let c = &self.counters;
        JoinStats {
            loglines_total: c.loglines_total.load(Ordering::Relaxed),
            loglines_invalid: c.loglines_invalid.load(Ordering::Relaxed),
            late_events_dropped: c.late_events_dropped.load(Ordering::Relaxed),
            joined_sessions: c.joined_sessions.load(Ordering::Relaxed),
            joined_queries: c.joined_queries.load(Ordering::Relaxed),
            joined_item_visits: c.joined_item_visits.load(Ordering::Relaxed),
            active_sessions: self.num_sessions(),
            cache_size: self.cache_size(),
        }
    }

    /// Write statistics to `path`: Prometheus text when metrics are
    /// attached, otherwise the [`JoinStats`] snapshot as JSON.
    pub fn export_stats(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        match &self.metrics {
            Some(m) => m.export(path),
            None => {
                let json = serde_json::to_string_pretty(&self.stats())
                    .map_err(std::io::Error::other)?;
                std::fs::write(path, json)
            }
        }
    }

    fn reject(&self, tenant: &str, line: &str, err: &JoinError) {
        self.counters
            .loglines_invalid
            .fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.record_invalid(err.reason());
        }
        warn!("invalid logline for tenant {}: {}", tenant, err);
        if let Some(dlq) = &self.dead_letter {
            dlq.write(tenant, err, line);
        }
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the outbox into the sink in queue order.
    ///
    /// Returns once everything queued before the call has been delivered,
    /// whether by this task or by one that held the gate earlier.
    async fn deliver(&self) {
        let _gate = self.delivery.lock().await;
        loop {
            let next = self.lock_outbox().pop_front();
            let Some(emission) = next else {
                break;
            };
            self.emit(emission).await;
        }
    }

    async fn emit(&self, emission: Emission) {
        let dry_run = self.config.dry_run;
        match emission {
            Emission::Query(query) => {
                self.counters.joined_queries.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.joined_queries.inc();
                }
                if dry_run {
                    return;
                }
                if let Err(e) = self.sink.record_joined_query(&query).await {
                    error!("Sink {} error on query {}~{}: {}", self.sink.name(), query.uid, query.event_id, e);
                }
            }
            Emission::ItemVisit(mut visit) => {
                self.counters
                    .joined_item_visits
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.joined_item_visits.inc();
                }
                if dry_run {
                    return;
                }
                if self.config.enable_cache {
                    self.enrich(&mut visit).await;
                }
                if let Err(e) = self.sink.record_joined_item_visit(&visit).await {
                    error!("Sink {} error on item visit {}~{}: {}", self.sink.name(), visit.uid, visit.event_id, e);
                }
            }
            Emission::Session(session) => {
                self.counters.joined_sessions.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = &self.metrics {
                    m.joined_sessions.inc();
                }
                if dry_run {
                    return;
                }
                if let Err(e) = self.sink.record_joined_session(&session).await {
                    error!("Sink {} error on session {}: {}", self.sink.name(), session.uid, e);
                }
            }
        }
    }

    async fn enrich(&self, visit: &mut JoinedItemVisit) {
        let (Some(cache), Some(item)) = (&self.features, &visit.item) else {
            return;
        };

        match cache.get(&visit.tenant, item).await {
            Ok(lookup) => {
                if let Some(m) = &self.metrics {
                    if lookup.cached {
                        m.feature_cache_hits.inc();
                    } else {
                        m.feature_cache_misses.inc();
                    }
                }
                for (key, value) in lookup.features.into_iter().flatten() {
                    visit.attrs.insert(format!("f_{}", key), value);
                }
            }
            Err(e) => warn!(
                "feature lookup for {} via {} failed: {}",
                item,
                cache.store_name(),
                e
            ),
        }
    }

    fn observe(&self, stream_time: DateTime<Utc>) {
        if let Some(m) = &self.metrics {
            m.active_sessions.set(self.registry.len() as i64);
            m.stream_time.set(stream_time.timestamp() as f64);
        }
        debug!("stream_time={}", stream_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Attributes, ItemRef};
    use crate::features::StaticFeatureStore;
    use crate::sink::MemorySink;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn join_with(config: JoinConfig) -> (LogJoin, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (LogJoin::new(config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_query_then_click_scenario() {
        let (join, sink) = join_with(JoinConfig::default());

        let r = join
            .insert_logline("shop", "c=u1~q1&e=q&qstr=shoes", Some(at(0)))
            .await
            .unwrap();
        assert_eq!(r.merge, MergeOutcome::Inserted);
        assert!(join.has_session("u1"));

        let r = join
            .insert_logline("shop", "c=u1~q1&e=q&clicked=1", Some(at(10)))
            .await
            .unwrap();
        assert_eq!(r.merge, MergeOutcome::Merged);
        assert!(sink.is_empty());

        let report = join.flush(join.advance_clock(at(901))).await;
        assert_eq!(report.queries_flushed, 1);
        assert_eq!(report.sessions_flushed, 0);
        let queries = sink.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].attrs.get("clicked").map(String::as_str), Some("1"));
        assert_eq!(queries[0].attrs.get("qstr").map(String::as_str), Some("shoes"));

        let report = join.flush(join.advance_clock(at(1_811))).await;
        assert_eq!(report.sessions_flushed, 1);
        assert_eq!(sink.sessions().len(), 1);
        assert_eq!(sink.queries().len(), 1);
        assert!(!join.has_session("u1"));
        assert_eq!(join.num_sessions(), 0);
    }

    #[tokio::test]
    async fn test_item_visit_emitted_on_first_merge() {
        let (join, sink) = join_with(JoinConfig::default());
        join.insert_logline("shop", "c=u1~v1&e=v&i=s~a", Some(at(0)))
            .await
            .unwrap();
        join.insert_logline("shop", "c=u1~v1&e=v&i=s~a&l=de", Some(at(1)))
            .await
            .unwrap();

        let visits = sink.item_visits();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].item, Some(ItemRef::new("s", "a")));
        assert_eq!(join.stats().joined_item_visits, 1);
    }

    #[tokio::test]
    async fn test_inline_flush_when_other_user_advances_clock() {
        let (join, sink) = join_with(JoinConfig::default());
        join.insert_logline("shop", "c=u1~q1&e=q", Some(at(0)))
            .await
            .unwrap();
        join.insert_logline("shop", "c=u2~q1&e=q", Some(at(5_000)))
            .await
            .unwrap();
        assert_eq!(join.stream_time(), at(5_000));

        // A late event for u1: the inline evaluation sees stream time 5000
        let r = join
            .insert_logline("shop", "c=u1~q2&e=q", Some(at(10)))
            .await
            .unwrap();
        assert!(r.session_flushed);
        assert_eq!(r.queries_flushed, 2);
        assert!(!join.has_session("u1"));
        assert_eq!(sink.sessions().len(), 1);
        assert_eq!(sink.sessions()[0].uid, "u1");
    }

    #[tokio::test]
    async fn test_late_event_after_query_flush_is_dropped() {
        let (join, sink) = join_with(JoinConfig::default());
        join.insert_logline("shop", "c=u1~q1&e=q&qstr=shoes", Some(at(0)))
            .await
            .unwrap();
        join.insert_logline("shop", "c=u1~v1&e=v", Some(at(1_000)))
            .await
            .unwrap();
        assert_eq!(sink.queries().len(), 1);

        let r = join
            .insert_logline("shop", "c=u1~q1&e=q&qstr=boots", Some(at(1_001)))
            .await
            .unwrap();
        assert_eq!(r.merge, MergeOutcome::DroppedFlushed);
        assert_eq!(sink.queries().len(), 1);
        assert_eq!(join.stats().late_events_dropped, 1);

        join.drain().await;
        let session = &sink.sessions()[0];
        assert_eq!(
            session.queries[0].attrs.get("qstr").map(String::as_str),
            Some("shoes")
        );
    }

    #[tokio::test]
    async fn test_invalid_line_does_not_touch_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path().join("dlq.jsonl")).unwrap();
        let sink = Arc::new(MemorySink::new());
        let join = LogJoin::new(JoinConfig::default(), sink.clone())
            .with_dead_letter(dlq)
            .with_metrics(JoinMetrics::new());

        let err = join
            .insert_logline("shop", "c=u1~q1&qstr=shoes", Some(at(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Parse(_)));
        assert_eq!(join.num_sessions(), 0);
        assert_eq!(join.stream_time(), DateTime::<Utc>::UNIX_EPOCH);

        let stats = join.stats();
        assert_eq!(stats.loglines_total, 1);
        assert_eq!(stats.loglines_invalid, 1);
        let text = join.metrics().unwrap().gather();
        assert!(text.contains("reason=\"parse\""));

        let dlq = std::fs::read_to_string(dir.path().join("dlq.jsonl")).unwrap();
        assert_eq!(dlq.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_suppresses_sink() {
        let (join, sink) = join_with(JoinConfig {
            dry_run: true,
            ..JoinConfig::default()
        });
        join.insert_logline("shop", "c=u1~q1&e=q", Some(at(0)))
            .await
            .unwrap();
        join.insert_logline("shop", "c=u1~v1&e=v&i=s~a", Some(at(1)))
            .await
            .unwrap();
        let report = join.flush(join.advance_clock(at(5_000))).await;

        assert_eq!(report.sessions_flushed, 1);
        assert!(sink.is_empty());
        let stats = join.stats();
        assert_eq!(stats.joined_sessions, 1);
        assert_eq!(stats.joined_queries, 1);
        assert_eq!(stats.joined_item_visits, 1);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_enable_cache_enriches_item_visits() {
        let mut features = Attributes::default();
        features.insert("price".into(), "1999".into());
        let store = StaticFeatureStore::new().with_item("shop", ItemRef::new("s", "a"), features);
        let cache = FeatureCache::new(Arc::new(store), std::time::Duration::from_secs(60));

        let sink = Arc::new(MemorySink::new());
        let join = LogJoin::new(
            JoinConfig {
                enable_cache: true,
                ..JoinConfig::default()
            },
            sink.clone(),
        )
        .with_feature_cache(cache);

        join.insert_logline("shop", "c=u1~v1&e=v&i=s~a", Some(at(0)))
            .await
            .unwrap();
        let visit = &sink.item_visits()[0];
        assert_eq!(visit.attrs.get("f_price").map(String::as_str), Some("1999"));
        assert_eq!(join.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_cache_not_consulted_when_disabled() {
        let store = StaticFeatureStore::new();
        let cache = FeatureCache::new(Arc::new(store), std::time::Duration::from_secs(60));
        let sink = Arc::new(MemorySink::new());
        let join = LogJoin::new(JoinConfig::default(), sink.clone()).with_feature_cache(cache);

        join.insert_logline("shop", "c=u1~v1&e=v&i=s~a", Some(at(0)))
            .await
            .unwrap();
        assert_eq!(join.cache_size(), 0);
        assert!(sink.item_visits()[0].attrs.is_empty());
    }

    #[tokio::test]
    async fn test_export_stats_json_without_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let (join, _sink) = join_with(JoinConfig::default());
        join.insert_logline("shop", "c=u1~q1&e=q", Some(at(0)))
            .await
            .unwrap();

        join.export_stats(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["loglines_total"], 1);
        assert_eq!(json["active_sessions"], 1);
    }
}
