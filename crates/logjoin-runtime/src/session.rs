//! Per-user session state and the merge step.
//!
//! A session owns one record per event id for queries and item visits.
//! Merging is idempotent: applying the same event twice leaves the same state
//! as applying it once. Per attribute the newest value wins; result items are
//! unioned and click markers are sticky.

use crate::event::{
    Attributes, EventKind, FxIndexMap, ItemRef, ItemVisitPayload, LogEvent, QueryItem,
    QueryPayload,
};
use crate::record::{JoinedItemVisit, JoinedQuery, JoinedSession};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// A search query and everything later events attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedQuery {
    /// First occurrence of the event id.
    pub time: DateTime<Utc>,
    pub flushed: bool,
    pub items: Vec<QueryItem>,
    pub attrs: Attributes,
}

impl TrackedQuery {
    pub fn new(time: DateTime<Utc>, payload: QueryPayload) -> Self {
        let mut query = Self {
            time,
            flushed: false,
            items: Vec::with_capacity(payload.items.len()),
            attrs: Attributes::default(),
        };
        query.merge(time, payload);
        query
    }

    /// Fold a later event for the same event id into this query.
    pub fn merge(&mut self, time: DateTime<Utc>, payload: QueryPayload) {
        self.time = self.time.min(time);
        for incoming in payload.items {
            match self.items.iter_mut().find(|i| i.item == incoming.item) {
                Some(existing) => {
                    if incoming.position.is_some() {
                        existing.position = incoming.position;
                    }
                    existing.clicked |= incoming.clicked;
                }
                None => self.items.push(incoming),
            }
        }
        self.attrs.extend(payload.attrs);
    }

    pub fn to_joined(&self, tenant: &str, uid: &str, event_id: &str) -> JoinedQuery {
        JoinedQuery {
            tenant: tenant.to_string(),
            uid: uid.to_string(),
            event_id: event_id.to_string(),
            time: self.time,
            items: self.items.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

/// An item detail page view. Has no flush timer of its own.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItemVisit {
    pub time: DateTime<Utc>,
    pub item: Option<ItemRef>,
    pub attrs: Attributes,
}

impl TrackedItemVisit {
    pub fn new(time: DateTime<Utc>, payload: ItemVisitPayload) -> Self {
        Self {
            time,
            item: payload.item,
            attrs: payload.attrs,
        }
    }

    pub fn merge(&mut self, time: DateTime<Utc>, payload: ItemVisitPayload) {
        self.time = self.time.min(time);
        if payload.item.is_some() {
            self.item = payload.item;
        }
        self.attrs.extend(payload.attrs);
    }

    pub fn to_joined(&self, tenant: &str, uid: &str, event_id: &str) -> JoinedItemVisit {
        JoinedItemVisit {
            tenant: tenant.to_string(),
            uid: uid.to_string(),
            event_id: event_id.to_string(),
            time: self.time,
            item: self.item.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

/// What the merge step did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First event for this event id.
    Inserted,
    /// Folded into an existing, unflushed record.
    Merged,
    /// The record was already flushed; the event was discarded.
    DroppedFlushed,
}

/// Accumulated state for one user id.
#[derive(Debug, Clone)]
pub struct TrackedSession {
    pub tenant: String,
    /// Maximum event timestamp observed for this user. Never decreases.
    pub last_seen: DateTime<Utc>,
    pub queries: FxIndexMap<String, TrackedQuery>,
    pub item_visits: FxIndexMap<String, TrackedItemVisit>,
    /// Set once the session has been emitted; a closed session accepts no
    /// further events and is waiting to be unlinked from the registry.
    closed: bool,
}

impl TrackedSession {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
            queries: FxIndexMap::default(),
            item_visits: FxIndexMap::default(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Fold a decoded event into the matching per-event-id record.
    ///
    /// Never emits anything; the flush policy runs afterwards.
    pub fn merge(&mut self, event: LogEvent) -> MergeOutcome {
        assert!(!self.closed, "merge into a closed session for {}", event.uid);

        if event.time > self.last_seen {
            self.last_seen = event.time;
        }

        match event.kind {
            EventKind::Query(payload) => match self.queries.get_mut(&event.event_id) {
                None => {
                    self.queries
                        .insert(event.event_id, TrackedQuery::new(event.time, payload));
                    MergeOutcome::Inserted
                }
                Some(query) if query.flushed => {
                    debug!(
                        "dropping late event for flushed query {}~{}",
                        event.uid, event.event_id
                    );
                    MergeOutcome::DroppedFlushed
                }
                Some(query) => {
                    query.merge(event.time, payload);
                    MergeOutcome::Merged
                }
            },
            EventKind::ItemVisit(payload) => match self.item_visits.get_mut(&event.event_id) {
                None => {
                    self.item_visits
                        .insert(event.event_id, TrackedItemVisit::new(event.time, payload));
                    MergeOutcome::Inserted
                }
                Some(visit) => {
                    visit.merge(event.time, payload);
                    MergeOutcome::Merged
                }
            },
        }
    }

    /// Mark result items of open queries as clicked when the same item was
    /// visited within `window` after the query.
    pub fn join_clicks(&mut self, window: Duration) {
        let visits: Vec<(&ItemRef, DateTime<Utc>)> = self
            .item_visits
            .values()
            .filter_map(|v| v.item.as_ref().map(|item| (item, v.time)))
            .collect();
        if visits.is_empty() {
            return;
        }

        for query in self.queries.values_mut().filter(|q| !q.flushed) {
            let deadline = query.time + window;
            for result in query.items.iter_mut().filter(|i| !i.clicked) {
                result.clicked = visits
                    .iter()
                    .any(|(item, t)| **item == result.item && *t >= query.time && *t <= deadline);
            }
        }
    }

    /// Snapshot of the whole session, flushed or not.
    pub fn to_joined(&self, uid: &str) -> JoinedSession {
        JoinedSession {
            tenant: self.tenant.clone(),
            uid: uid.to_string(),
            last_seen: self.last_seen,
            queries: self
                .queries
                .iter()
                .map(|(eid, q)| q.to_joined(&self.tenant, uid, eid))
                .collect(),
            item_visits: self
                .item_visits
                .iter()
                .map(|(eid, v)| v.to_joined(&self.tenant, uid, eid))
                .collect(),
        }
    }
}
