//! Sink implementations for joined records

use crate::record::{JoinedItemVisit, JoinedQuery, JoinedRecord, JoinedSession};
use anyhow::Result;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::error;

/// Trait for downstream consumers of joined records
#[async_trait]
pub trait JoinSink: Send + Sync {
    /// Name of this sink
    fn name(&self) -> &str;

    /// Called exactly once per query event id, when it is flushed
    async fn record_joined_query(&self, query: &JoinedQuery) -> Result<()>;

    /// Called once per item visit, when it is first merged
    async fn record_joined_item_visit(&self, visit: &JoinedItemVisit) -> Result<()>;

    /// Called exactly once per session, when it is flushed
    async fn record_joined_session(&self, session: &JoinedSession) -> Result<()>;

    /// Flush any buffered data
    async fn flush(&self) -> Result<()>;
}

/// Console sink - prints to stdout
pub struct ConsoleSink {
    name: String,
    pretty: bool,
}

impl ConsoleSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pretty: false,
        }
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    fn print(&self, record: &JoinedRecord) -> Result<()> {
        let line = if self.pretty {
            serde_json::to_string_pretty(record)?
        } else {
            serde_json::to_string(record)?
        };
        println!("{}", line);
        Ok(())
    }
}

#[async_trait]
impl JoinSink for ConsoleSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn record_joined_query(&self, query: &JoinedQuery) -> Result<()> {
        self.print(&JoinedRecord::Query(query.clone()))
    }

    async fn record_joined_item_visit(&self, visit: &JoinedItemVisit) -> Result<()> {
        self.print(&JoinedRecord::ItemVisit(visit.clone()))
    }

    async fn record_joined_session(&self, session: &JoinedSession) -> Result<()> {
        self.print(&JoinedRecord::Session(session.clone()))
    }

    async fn flush(&self) -> Result<()> {
        std::io::stdout().flush()?;
        Ok(())
    }
}

/// File sink - appends one JSON object per record
pub struct JsonLinesSink {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            name: name.into(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &JoinedRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

#[async_trait]
impl JoinSink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn record_joined_query(&self, query: &JoinedQuery) -> Result<()> {
        self.append(&JoinedRecord::Query(query.clone()))
    }

    async fn record_joined_item_visit(&self, visit: &JoinedItemVisit) -> Result<()> {
        self.append(&JoinedRecord::ItemVisit(visit.clone()))
    }

    async fn record_joined_session(&self, session: &JoinedSession) -> Result<()> {
        self.append(&JoinedRecord::Session(session.clone()))
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink that keeps every record in arrival order
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<JoinedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JoinedRecord> {
        self.lock().clone()
    }

    pub fn queries(&self) -> Vec<JoinedQuery> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                JoinedRecord::Query(q) => Some(q.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn item_visits(&self) -> Vec<JoinedItemVisit> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                JoinedRecord::ItemVisit(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sessions(&self) -> Vec<JoinedSession> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                JoinedRecord::Session(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, record: JoinedRecord) {
        self.lock().push(record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinedRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl JoinSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record_joined_query(&self, query: &JoinedQuery) -> Result<()> {
        self.push(JoinedRecord::Query(query.clone()));
        Ok(())
    }

    async fn record_joined_item_visit(&self, visit: &JoinedItemVisit) -> Result<()> {
        self.push(JoinedRecord::ItemVisit(visit.clone()));
        Ok(())
    }

    async fn record_joined_session(&self, session: &JoinedSession) -> Result<()> {
        self.push(JoinedRecord::Session(session.clone()));
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Multi-sink that broadcasts to multiple sinks
pub struct MultiSink {
    name: String,
    sinks: Vec<Arc<dyn JoinSink>>,
}

impl MultiSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn JoinSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl JoinSink for MultiSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn record_joined_query(&self, query: &JoinedQuery) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.record_joined_query(query).await {
                error!("Sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn record_joined_item_visit(&self, visit: &JoinedItemVisit) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.record_joined_item_visit(visit).await {
                error!("Sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn record_joined_session(&self, session: &JoinedSession) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.record_joined_session(session).await {
                error!("Sink {} error: {}", sink.name(), e);
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.flush().await {
                error!("Sink {} flush error: {}", sink.name(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Attributes;
    use chrono::{DateTime, Utc};

    fn query(uid: &str) -> JoinedQuery {
        JoinedQuery {
            tenant: "shop".into(),
            uid: uid.into(),
            event_id: "q1".into(),
            time: DateTime::<Utc>::UNIX_EPOCH,
            items: Vec::new(),
            attrs: Attributes::default(),
        }
    }

    fn session(uid: &str) -> JoinedSession {
        JoinedSession {
            tenant: "shop".into(),
            uid: uid.into(),
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
            queries: vec![query(uid)],
            item_visits: Vec::new(),
        }
    }

    struct FailingSink;

    #[async_trait]
    impl JoinSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        async fn record_joined_query(&self, _: &JoinedQuery) -> Result<()> {
            anyhow::bail!("downstream unavailable")
        }
        async fn record_joined_item_visit(&self, _: &JoinedItemVisit) -> Result<()> {
            anyhow::bail!("downstream unavailable")
        }
        async fn record_joined_session(&self, _: &JoinedSession) -> Result<()> {
            anyhow::bail!("downstream unavailable")
        }
        async fn flush(&self) -> Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects_in_order() {
        let sink = MemorySink::new();
        sink.record_joined_query(&query("u1")).await.unwrap();
        sink.record_joined_session(&session("u1")).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.queries().len(), 1);
        assert_eq!(sink.sessions().len(), 1);
        assert!(sink.item_visits().is_empty());
        assert!(matches!(sink.records()[1], JoinedRecord::Session(_)));
    }

    #[tokio::test]
    async fn test_json_lines_sink_writes_tagged_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("joined.jsonl");

        let sink = JsonLinesSink::new("file", &path).unwrap();
        sink.record_joined_query(&query("u1")).await.unwrap();
        sink.record_joined_session(&session("u1")).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: JoinedRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, JoinedRecord::Query(query("u1")));
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "session");
        assert_eq!(sink.path(), path.as_path());
    }

    #[tokio::test]
    async fn test_multi_sink_survives_failing_child() {
        let memory = Arc::new(MemorySink::new());
        let multi = MultiSink::new("fanout")
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());

        multi.record_joined_query(&query("u1")).await.unwrap();
        multi.record_joined_session(&session("u1")).await.unwrap();
        multi.flush().await.unwrap();

        assert_eq!(memory.len(), 2);
        assert_eq!(multi.name(), "fanout");
    }
}
