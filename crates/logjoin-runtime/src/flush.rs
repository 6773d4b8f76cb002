//! Flush policy: decides which queries and sessions are complete.
//!
//! Two independent timeouts apply. A query is emitted on its own once its
//! click attribution window (`max_query_click_delay`) has passed, while the
//! session stays open for further traffic until it has been idle for longer
//! than `session_idle_timeout`.

use crate::record::{JoinedQuery, JoinedSession};
use crate::session::TrackedSession;
use chrono::{DateTime, Duration, Utc};

/// Default idle time after which a whole session is flushed.
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECS: i64 = 1800;

/// Default time a query waits for matching clicks before being flushed.
pub const DEFAULT_MAX_QUERY_CLICK_DELAY_SECS: i64 = 900;

/// Timeout configuration for flush decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub session_idle_timeout: Duration,
    pub max_query_click_delay: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            session_idle_timeout: Duration::seconds(DEFAULT_SESSION_IDLE_TIMEOUT_SECS),
            max_query_click_delay: Duration::seconds(DEFAULT_MAX_QUERY_CLICK_DELAY_SECS),
        }
    }
}

/// Records produced by one flush evaluation, in emission order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlushDecision {
    /// Queries flushed individually by this evaluation.
    pub queries: Vec<JoinedQuery>,
    /// The whole session, if it was flushed. The session is closed and must
    /// be unlinked from the registry.
    pub session: Option<JoinedSession>,
}

impl FlushDecision {
    pub fn session_flushed(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty() && self.session.is_none()
    }
}

impl FlushPolicy {
    pub fn new(session_idle_timeout: Duration, max_query_click_delay: Duration) -> Self {
        Self {
            session_idle_timeout,
            max_query_click_delay,
        }
    }

    /// Evaluate `session` against `stream_time`.
    ///
    /// Marks due queries as flushed and closes the session when it is idle.
    /// A stream time behind the session's `last_seen` never flushes anything.
    pub fn evaluate(
        &self,
        uid: &str,
        session: &mut TrackedSession,
        stream_time: DateTime<Utc>,
    ) -> FlushDecision {
        if session.is_closed() || stream_time < session.last_seen {
            return FlushDecision::default();
        }

        let session_due = stream_time - session.last_seen > self.session_idle_timeout;
        let due_queries: Vec<String> = session
            .queries
            .iter()
            .filter(|(_, q)| !q.flushed && stream_time - q.time > self.max_query_click_delay)
            .map(|(eid, _)| eid.clone())
            .collect();

        if !session_due && due_queries.is_empty() {
            return FlushDecision::default();
        }

        self.finish(uid, session, due_queries, session_due)
    }

    /// Flush every open query and the session itself regardless of time.
    pub fn force(&self, uid: &str, session: &mut TrackedSession) -> FlushDecision {
        if session.is_closed() {
            return FlushDecision::default();
        }
        let open: Vec<String> = session
            .queries
            .iter()
            .filter(|(_, q)| !q.flushed)
            .map(|(eid, _)| eid.clone())
            .collect();
        self.finish(uid, session, open, true)
    }

    fn finish(
        &self,
        uid: &str,
        session: &mut TrackedSession,
        due_queries: Vec<String>,
        close_session: bool,
    ) -> FlushDecision {
        session.join_clicks(self.max_query_click_delay);

        let mut decision = FlushDecision::default();
        for eid in due_queries {
            if let Some(query) = session.queries.get_mut(&eid) {
                query.flushed = true;
                decision
                    .queries
                    .push(query.to_joined(&session.tenant, uid, &eid));
            }
        }

        if close_session {
            decision.session = Some(session.to_joined(uid));
            session.close();
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn session_with(lines: &[(&str, i64)]) -> TrackedSession {
        let mut session = TrackedSession::new("shop");
        for (line, secs) in lines {
            session.merge(decode("shop", line, Some(at(*secs))).unwrap());
        }
        session
    }

    #[test]
    fn test_session_idle_boundary() {
        let policy = FlushPolicy::default();

        let mut session = session_with(&[("c=u1~v1&e=v&i=s~a", 1_000)]);
        assert!(policy.evaluate("u1", &mut session, at(1_000 + 1_799)).is_empty());
        assert!(!session.is_closed());

        let decision = policy.evaluate("u1", &mut session, at(1_000 + 1_801));
        assert!(decision.session_flushed());
        assert!(session.is_closed());
    }

    #[test]
    fn test_exactly_at_timeout_is_not_due() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0)]);
        let decision = policy.evaluate("u1", &mut session, at(1_800));
        assert!(!decision.session_flushed());
        // The query however is past its 900s window
        assert_eq!(decision.queries.len(), 1);
    }

    #[test]
    fn test_query_click_delay_boundary() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0), ("c=u1~v1&e=v", 800)]);

        assert!(policy.evaluate("u1", &mut session, at(899)).is_empty());

        let decision = policy.evaluate("u1", &mut session, at(901));
        assert_eq!(decision.queries.len(), 1);
        assert_eq!(decision.queries[0].event_id, "q1");
        assert!(!decision.session_flushed());
        assert!(session.queries["q1"].flushed);
    }

    #[test]
    fn test_query_flushed_only_once() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0), ("c=u1~v1&e=v", 1_000)]);

        assert_eq!(policy.evaluate("u1", &mut session, at(1_000)).queries.len(), 1);
        assert!(policy.evaluate("u1", &mut session, at(1_100)).is_empty());
    }

    #[test]
    fn test_stream_time_behind_last_seen() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0), ("c=u1~q2&e=q", 5_000)]);
        // q1 would be overdue at 4_000, but the session has seen 5_000 already.
        assert!(policy.evaluate("u1", &mut session, at(4_000)).is_empty());
        assert!(!session.queries["q1"].flushed);
    }

    #[test]
    fn test_session_flush_includes_flushed_queries() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0), ("c=u1~q2&e=q", 10)]);

        let decision = policy.evaluate("u1", &mut session, at(2_000));
        assert_eq!(decision.queries.len(), 2);
        let joined = decision.session.expect("session flushed");
        assert_eq!(joined.queries.len(), 2);
    }

    #[test]
    fn test_click_join_happens_before_query_emission() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[
            ("c=u1~q1&e=q&is=s~a~p1,s~b~p2", 0),
            ("c=u1~v1&e=v&i=s~b", 30),
        ]);
        let decision = policy.evaluate("u1", &mut session, at(901));
        assert_eq!(decision.queries[0].clicks(), 1);
        assert!(decision.queries[0].items[1].clicked);
    }

    #[test]
    fn test_force_flushes_everything() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0), ("c=u1~q2&e=q", 10)]);
        session.queries.get_mut("q1").unwrap().flushed = true;

        let decision = policy.force("u1", &mut session);
        assert_eq!(decision.queries.len(), 1);
        assert_eq!(decision.queries[0].event_id, "q2");
        assert!(decision.session_flushed());
        assert!(policy.force("u1", &mut session).is_empty());
    }

    #[test]
    fn test_closed_session_is_never_reemitted() {
        let policy = FlushPolicy::default();
        let mut session = session_with(&[("c=u1~q1&e=q", 0)]);
        assert!(policy.evaluate("u1", &mut session, at(5_000)).session_flushed());
        assert!(policy.evaluate("u1", &mut session, at(9_000)).is_empty());
    }
}
