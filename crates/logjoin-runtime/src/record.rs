//! Joined output records handed to sinks.
//!
//! Records are owned snapshots: a sink never holds a reference into live
//! session state and never mutates what it receives.

use crate::event::{Attributes, ItemRef, QueryItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A query emitted once its click attribution window has closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedQuery {
    pub tenant: String,
    pub uid: String,
    pub event_id: String,
    pub time: DateTime<Utc>,
    pub items: Vec<QueryItem>,
    pub attrs: Attributes,
}

impl JoinedQuery {
    /// Number of result items that received a click.
    pub fn clicks(&self) -> usize {
        self.items.iter().filter(|i| i.clicked).count()
    }
}

/// An item visit, emitted when it is first seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedItemVisit {
    pub tenant: String,
    pub uid: String,
    pub event_id: String,
    pub time: DateTime<Utc>,
    pub item: Option<ItemRef>,
    pub attrs: Attributes,
}

/// Everything a session accumulated up to the moment it was flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedSession {
    pub tenant: String,
    pub uid: String,
    pub last_seen: DateTime<Utc>,
    pub queries: Vec<JoinedQuery>,
    pub item_visits: Vec<JoinedItemVisit>,
}

/// Any joined record, tagged with its kind when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinedRecord {
    Query(JoinedQuery),
    ItemVisit(JoinedItemVisit),
    Session(JoinedSession),
}

impl JoinedRecord {
    pub fn uid(&self) -> &str {
        match self {
            JoinedRecord::Query(q) => &q.uid,
            JoinedRecord::ItemVisit(v) => &v.uid,
            JoinedRecord::Session(s) => &s.uid,
        }
    }
}
