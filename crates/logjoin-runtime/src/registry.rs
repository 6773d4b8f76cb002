//! Concurrent registry of live sessions keyed by user id.
//!
//! Two lock levels: the registry lock guards the map structure, each session
//! has its own lock for its body. Acquisition order is always registry then
//! session. The session lock is never exposed; callers run their critical
//! section through [`SessionRegistry::with_session`] or
//! [`SessionRegistry::for_each_session`].

use crate::session::TrackedSession;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type SessionSlot = Arc<Mutex<TrackedSession>>;

/// Owns every live [`TrackedSession`].
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<FxHashMap<String, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or create the session for `uid` and run `f` on it.
    ///
    /// The session lock is acquired while the registry lock is still held, so
    /// no flush pass can unlink the session in between. The registry lock is
    /// released before `f` runs; inserts for different users do not contend.
    pub fn with_session<R>(
        &self,
        tenant: &str,
        uid: &str,
        f: impl FnOnce(&mut TrackedSession) -> R,
    ) -> R {
        let mut sessions = self.lock_sessions();
        let slot = live_slot(&mut sessions, tenant, uid);
        let mut session = lock_session(&slot);
        drop(sessions);
        f(&mut session)
    }

    /// Run `f` on every live session while holding the registry lock.
    ///
    /// Each session lock is taken in turn, blocking on any in-flight insert.
    /// Sessions for which `f` returns `true` are removed during the pass.
    pub fn for_each_session(&self, mut f: impl FnMut(&str, &mut TrackedSession) -> bool) {
        let mut sessions = self.lock_sessions();
        sessions.retain(|uid, slot| {
            let mut session = lock_session(slot);
            if session.is_closed() {
                return false;
            }
            !f(uid, &mut session)
        });
    }

    /// Unlink the session for `uid` after its final emission.
    ///
    /// Only closed sessions are removed; returns whether one was.
    pub fn remove(&self, uid: &str) -> bool {
        let mut sessions = self.lock_sessions();
        let closed = sessions
            .get(uid)
            .map(|slot| lock_session(slot).is_closed())
            .unwrap_or(false);
        if closed {
            sessions.remove(uid);
        }
        closed
    }

    /// Number of sessions in the map, including closed ones not yet unlinked.
    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.lock_sessions()
            .get(uid)
            .map(|slot| !lock_session(slot).is_closed())
            .unwrap_or(false)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, FxHashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Existing open session for `uid`, or a freshly inserted one.
///
/// A closed session still in the map (flushed by an insert that has not yet
/// unlinked it) is replaced rather than reopened.
fn live_slot(
    sessions: &mut FxHashMap<String, SessionSlot>,
    tenant: &str,
    uid: &str,
) -> SessionSlot {
    if let Some(slot) = sessions.get(uid) {
        if !lock_session(slot).is_closed() {
            return Arc::clone(slot);
        }
    }
    let slot = Arc::new(Mutex::new(TrackedSession::new(tenant)));
    sessions.insert(uid.to_string(), Arc::clone(&slot));
    slot
}

fn lock_session(slot: &SessionSlot) -> MutexGuard<'_, TrackedSession> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}
