//! Dead letter file for log lines that could not be decoded.
//!
//! Each rejected line is appended as one JSON object together with the
//! decoder error, so the lines can be replayed once the producer is fixed.

use crate::error::JoinError;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

#[derive(serde::Serialize)]
struct RejectedLine<'a> {
    /// RFC 3339 wall clock time of the rejection
    timestamp: String,
    tenant: &'a str,
    reason: &'static str,
    error: String,
    line: &'a str,
}

/// Append-only file of rejected pixel lines.
pub struct DeadLetterQueue {
    path: PathBuf,
    writer: Mutex<File>,
    written: AtomicU64,
}

impl DeadLetterQueue {
    /// Open `path` for appending, creating it when missing.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            written: AtomicU64::new(0),
        })
    }

    /// Record a rejected line. Write failures are logged, never propagated.
    pub fn write(&self, tenant: &str, error: &JoinError, line: &str) {
        let rejected = RejectedLine {
            timestamp: Utc::now().to_rfc3339(),
            tenant,
            reason: error.reason(),
            error: error.to_string(),
            line,
        };
        let json = match serde_json::to_string(&rejected) {
            Ok(json) => json,
            Err(e) => {
                warn!("cannot serialize rejected line: {}", e);
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(writer, "{}", json) {
            warn!("dead letter write to {} failed: {}", self.path.display(), e);
            return;
        }
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines successfully written since the file was opened.
    pub fn count(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejected.jsonl");

        let dlq = DeadLetterQueue::open(&path).unwrap();
        assert_eq!(dlq.count(), 0);

        dlq.write("shop", &JoinError::Parse("c param is missing".into()), "e=q");
        dlq.write("shop", &JoinError::UnsupportedEvent('u'), "c=u1~x&e=u");
        assert_eq!(dlq.count(), 2);

        let rows: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);

        let entry = &rows[0];
        assert_eq!(entry["tenant"], "shop");
        assert_eq!(entry["reason"], "parse");
        assert_eq!(entry["error"], "parse error: c param is missing");
        assert_eq!(entry["line"], "e=q");
        assert!(entry["timestamp"].is_string());

        assert_eq!(rows[1]["reason"], "unsupported_event");
        assert_eq!(dlq.path(), path.as_path());
    }
}
