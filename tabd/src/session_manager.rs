// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread-safe registry of [`Session`]s, keyed by id and by receive-endpoint
//! fd.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::ControlWaker;
use crate::session::Session;

/// Returned by [`SessionManager::insert`] on an id collision. Never
/// surfaced to a caller: whoever is allocating a new session retries with a
/// freshly-drawn id.
#[derive(Debug)]
pub struct DuplicateId;

struct Inner {
    by_id: HashMap<u64, Arc<Session>>,
    by_fd: HashMap<RawFd, Arc<Session>>,
}

/// A single mutex guards both indexes, so the two stay consistent at every
/// observable quiescent point; lookups return `Arc<Session>` so callers may
/// use the handle past the lock.
pub struct SessionManager {
    inner: Mutex<Inner>,
    waker: Arc<ControlWaker>,
}

impl SessionManager {
    /// Create an empty manager. `waker` is signaled on every insert/remove
    /// so `CommandSource` can re-snapshot its watch set.
    pub fn new(waker: Arc<ControlWaker>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_id: HashMap::new(),
                by_fd: HashMap::new(),
            }),
            waker,
        }
    }

    /// Add `session` to both indexes under a single lock.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), DuplicateId> {
        let mut inner = self.inner.lock();
        if inner.by_id.contains_key(&session.id()) {
            return Err(DuplicateId);
        }
        inner.by_fd.insert(session.recv_fd(), session.clone());
        inner.by_id.insert(session.id(), session);
        drop(inner);
        self.waker.wake();
        Ok(())
    }

    /// Look up a session by its opaque id.
    pub fn lookup_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// Look up a session by the raw fd of its receive endpoint.
    pub fn lookup_by_fd(&self, fd: RawFd) -> Option<Arc<Session>> {
        self.inner.lock().by_fd.get(&fd).cloned()
    }

    /// Remove a session from both indexes and mark it `Closed`.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let session = inner.by_id.remove(&id)?;
        inner.by_fd.remove(&session.recv_fd());
        drop(inner);
        session.mark_closed();
        self.waker.wake();
        Some(session)
    }

    /// A snapshot of every currently-registered session, for
    /// `CommandSource` to arm `poll` on.
    pub fn iter_sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().by_id.values().cloned().collect()
    }

    /// Number of currently-registered sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    /// Whether the manager currently holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn manager() -> SessionManager {
        let (writer, _reader) = UnixStream::pair().unwrap();
        SessionManager::new(Arc::new(ControlWaker::new(writer)))
    }

    fn session(id: u64) -> Arc<Session> {
        let (recv, _client_send) = UnixStream::pair().unwrap();
        let (_client_recv, send) = UnixStream::pair().unwrap();
        Arc::new(Session::new(id, recv, send))
    }

    #[test]
    fn insert_is_visible_through_both_indexes() {
        let manager = manager();
        let session = session(1);
        let fd = session.recv_fd();
        manager.insert(session.clone()).unwrap();
        assert_eq!(manager.lookup_by_id(1).unwrap().id(), 1);
        assert_eq!(manager.lookup_by_fd(fd).unwrap().id(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let manager = manager();
        manager.insert(session(7)).unwrap();
        let result = manager.insert(session(7));
        assert!(result.is_err());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn remove_drops_from_both_indexes() {
        let manager = manager();
        let session = session(3);
        let fd = session.recv_fd();
        manager.insert(session).unwrap();
        let removed = manager.remove(3).unwrap();
        assert_eq!(removed.state(), crate::session::SessionState::Closed);
        assert!(manager.lookup_by_id(3).is_none());
        assert!(manager.lookup_by_fd(fd).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn remove_unknown_id_is_a_no_op() {
        let manager = manager();
        assert!(manager.remove(99).is_none());
    }
}
