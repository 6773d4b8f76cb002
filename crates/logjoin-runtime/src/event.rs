//! Tracking pixel events and the log line decoder.
//!
//! A log line is a URL query string. Two parameters are mandatory:
//!
//! - `c`: composite identity `<uid>~<eventid>`
//! - `e`: single character event type (`q` query, `v` item visit)
//!
//! Query events may carry `is`, a comma separated list of result items in the
//! form `<setid>~<itemid>~p<pos>`. Item visits carry `i`, the visited item as
//! `<setid>~<itemid>`. Every other non-reserved parameter is kept verbatim as
//! a string attribute.

use crate::error::JoinError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Type alias for IndexMap with FxBuildHasher, used for pixel attributes.
pub type FxIndexMap<K, V> = IndexMap<K, V, FxBuildHasher>;

/// Free-form pixel attributes in arrival order.
pub type Attributes = FxIndexMap<String, String>;

/// Parameters that are never copied into attributes.
const RESERVED_PARAMS: &[&str] = &["c", "e", "v"];

/// Reference to a catalogue item: `<setid>~<itemid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub set_id: String,
    pub item_id: String,
}

impl ItemRef {
    pub fn new(set_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            set_id: set_id.into(),
            item_id: item_id.into(),
        }
    }

    /// Parse `<setid>~<itemid>`. Trailing `~` parts are ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('~');
        let set_id = parts.next().filter(|p| !p.is_empty())?;
        let item_id = parts.next().filter(|p| !p.is_empty())?;
        Some(Self::new(set_id, item_id))
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.set_id, self.item_id)
    }
}

/// One entry of a query's result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryItem {
    pub item: ItemRef,
    pub position: Option<u32>,
    /// Set once a matching item visit has been joined onto the query.
    pub clicked: bool,
}

impl QueryItem {
    /// Parse `<setid>~<itemid>[~p<pos>]`.
    pub fn parse(s: &str) -> Option<Self> {
        let item = ItemRef::parse(s)?;
        let position = s
            .split('~')
            .nth(2)
            .and_then(|p| p.strip_prefix('p'))
            .and_then(|p| p.parse().ok());
        Some(Self {
            item,
            position,
            clicked: false,
        })
    }
}

/// Payload of a `q` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub items: Vec<QueryItem>,
    pub attrs: Attributes,
}

/// Payload of a `v` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemVisitPayload {
    pub item: Option<ItemRef>,
    pub attrs: Attributes,
}

/// Closed set of event kinds understood by the join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Query(QueryPayload),
    ItemVisit(ItemVisitPayload),
}

impl EventKind {
    /// Kind label used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Query(_) => "query",
            EventKind::ItemVisit(_) => "item_visit",
        }
    }
}

/// A decoded log line. Transient: consumed by the merge step and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub tenant: String,
    pub uid: String,
    pub event_id: String,
    pub time: DateTime<Utc>,
    pub kind: EventKind,
}

/// Decode a raw pixel line.
///
/// `time` overrides the event timestamp; without it the event is stamped with
/// the current wall clock time. Never touches session state.
pub fn decode(tenant: &str, line: &str, time: Option<DateTime<Utc>>) -> Result<LogEvent, JoinError> {
    let query = line.trim().trim_start_matches('?');
    let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let c = param(&params, "c").ok_or_else(|| JoinError::parse("c param is missing"))?;
    let (uid, event_id) = c
        .split_once('~')
        .ok_or_else(|| JoinError::parse("c param is invalid"))?;
    if uid.is_empty() || event_id.is_empty() {
        return Err(JoinError::parse("c param is invalid"));
    }

    let evtype = param(&params, "e").ok_or_else(|| JoinError::parse("e param is missing"))?;
    let mut chars = evtype.chars();
    let tag = match (chars.next(), chars.next()) {
        (Some(tag), None) => tag,
        _ => return Err(JoinError::parse("e param is invalid")),
    };

    let kind = match tag {
        'q' => EventKind::Query(query_payload(&params)),
        'v' => EventKind::ItemVisit(item_visit_payload(&params)),
        other => return Err(JoinError::UnsupportedEvent(other)),
    };

    Ok(LogEvent {
        tenant: tenant.to_string(),
        uid: uid.to_string(),
        event_id: event_id.to_string(),
        time: time.unwrap_or_else(Utc::now),
        kind,
    })
}

/// User id from the `c` param without decoding the rest of the line.
///
/// Used to route lines of one user to the same ingest worker.
pub fn uid_of(line: &str) -> Option<String> {
    let query = line.trim().trim_start_matches('?');
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "c")
        .and_then(|(_, v)| {
            v.split_once('~')
                .map(|(uid, _)| uid.to_string())
                .filter(|uid| !uid.is_empty())
        })
}

/// First value for `key`, mirroring how pixel servers resolve duplicates.
fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn query_payload(params: &[(String, String)]) -> QueryPayload {
    let mut payload = QueryPayload::default();
    for (key, value) in params {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            continue;
        }
        if key == "is" {
            for entry in value.split(',').filter(|e| !e.is_empty()) {
                match QueryItem::parse(entry) {
                    Some(item) => payload.items.push(item),
                    None => debug!("skipping malformed result item '{}'", entry),
                }
            }
            continue;
        }
        payload.attrs.insert(key.clone(), value.clone());
    }
    payload
}

fn item_visit_payload(params: &[(String, String)]) -> ItemVisitPayload {
    let mut payload = ItemVisitPayload::default();
    for (key, value) in params {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            continue;
        }
        if key == "i" {
            payload.item = ItemRef::parse(value);
            continue;
        }
        payload.attrs.insert(key.clone(), value.clone());
    }
    payload
}
