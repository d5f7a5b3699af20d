//! Live sessions of the operator process, addressable by id.
//!
//! The map sits behind a mutex that is never held across an await. Only
//! snapshots leave the registry, plus the directive sender of a session
//! waiting on the operator when it is removed for a response or a
//! disconnect.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::oneshot;

use crate::bundle::SubmitterInfo;
use crate::errors::{RegError, Result};
use crate::session::{Directive, Phase, Session, SessionId, SessionSnapshot};

pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: Mutex<BTreeMap<SessionId, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SessionId, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next id and records a fresh session under it.
    /// Ids are never reused.
    pub fn register(&self, peer: String) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(id, Session::new(id, peer));
        debug!("registered session {id}");
        id
    }

    /// Sessions in arrival order.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.lock()
            .values()
            .map(Session::snapshot)
            .collect()
    }

    pub fn get(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.lock().get(&id).map(Session::snapshot)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns false if the session is no longer registered.
    pub fn set_announced(&self, id: SessionId, announced: u64) -> bool {
        match self.lock().get_mut(&id) {
            Some(session) => {
                session.announced_size = announced;
                session.phase = Phase::Receiving;
                true
            }
            None => false,
        }
    }

    /// Returns false if the session is no longer registered.
    pub fn set_received(&self, id: SessionId, received: u64) -> bool {
        match self.lock().get_mut(&id) {
            Some(session) => {
                debug_assert!(received >= session.received_size);
                debug_assert!(received <= session.announced_size);
                session.received_size = received;
                true
            }
            None => false,
        }
    }

    /// Marks a fully received session ready for the operator. Hands the
    /// waiter back if the session was removed in the meantime.
    pub fn mark_complete(
        &self,
        id: SessionId,
        document_name: String,
        submitter: SubmitterInfo,
        stored_at: PathBuf,
        waiter: oneshot::Sender<Directive>,
    ) -> std::result::Result<(), oneshot::Sender<Directive>> {
        match self.lock().get_mut(&id) {
            Some(session) => {
                session.phase = Phase::Complete;
                session.document_name = Some(document_name);
                session.submitter = Some(submitter);
                session.stored_at = Some(stored_at);
                session.waiter = Some(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Keeps a misbehaving session visible without accepting a response.
    pub fn flag(
        &self,
        id: SessionId,
        reason: String,
        waiter: oneshot::Sender<Directive>,
    ) -> std::result::Result<(), oneshot::Sender<Directive>> {
        match self.lock().get_mut(&id) {
            Some(session) => {
                session.phase = Phase::Flagged;
                session.flag_reason = Some(reason);
                session.waiter = Some(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionSnapshot> {
        self.lock().remove(&id).map(|mut session| {
            session.phase = Phase::Closed;
            session.snapshot()
        })
    }

    /// Removes a `Complete` session and returns its waiter for the
    /// response. Concurrent callers are serialized by the lock; all but the
    /// first see `SessionNotFound`.
    pub fn take_for_response(
        &self,
        id: SessionId,
    ) -> Result<(SessionSnapshot, oneshot::Sender<Directive>)> {
        let mut sessions = self.lock();
        let session = sessions
            .get(&id)
            .ok_or(RegError::SessionNotFound(id))?;
        if session.phase != Phase::Complete || session.waiter.is_none() {
            return Err(RegError::SessionNotReady(id));
        }
        let mut session = sessions
            .remove(&id)
            .ok_or(RegError::SessionNotFound(id))?;
        let waiter = session
            .waiter
            .take()
            .ok_or(RegError::SessionNotReady(id))?;
        session.phase = Phase::Closed;
        Ok((session.snapshot(), waiter))
    }

    /// Removes a session that is waiting on the operator (`Complete` or
    /// `Flagged`). Sessions still receiving cannot be evicted here.
    pub fn take_for_disconnect(
        &self,
        id: SessionId,
    ) -> Result<(SessionSnapshot, oneshot::Sender<Directive>)> {
        let mut sessions = self.lock();
        let session = sessions
            .get(&id)
            .ok_or(RegError::SessionNotFound(id))?;
        if session.waiter.is_none() {
            return Err(RegError::SessionNotReady(id));
        }
        let mut session = sessions
            .remove(&id)
            .ok_or(RegError::SessionNotFound(id))?;
        let waiter = session
            .waiter
            .take()
            .ok_or(RegError::SessionNotReady(id))?;
        session.phase = Phase::Closed;
        Ok((session.snapshot(), waiter))
    }

    /// Empties the registry, returning the waiter of every session that
    /// waits on the operator.
    pub fn drain(
        &self,
    ) -> Vec<(SessionId, Option<oneshot::Sender<Directive>>)> {
        std::mem::take(&mut *self.lock())
            .into_iter()
            .map(|(id, session)| (id, session.waiter))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter() -> oneshot::Sender<Directive> {
        oneshot::channel().0
    }

    fn submitter() -> SubmitterInfo {
        SubmitterInfo::new("Jane Doe", "Tech U", "555-0100")
    }

    fn complete(registry: &SessionRegistry, id: SessionId) {
        assert!(registry.set_announced(id, 10));
        assert!(registry.set_received(id, 10));
        assert!(registry
            .mark_complete(
                id,
                "id.jpg".into(),
                submitter(),
                PathBuf::from("docs/session-1/id.jpg"),
                waiter(),
            )
            .is_ok());
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let registry = SessionRegistry::new();
        let first = registry.register("a".into());
        let second = registry.register("b".into());
        registry.remove(first);
        let third = registry.register("c".into());
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[test]
    fn list_is_in_arrival_order() {
        let registry = SessionRegistry::new();
        for peer in ["x", "y", "z"] {
            registry.register(peer.into());
        }
        let peers: Vec<_> =
            registry.list().into_iter().map(|s| s.peer).collect();
        assert_eq!(peers, ["x", "y", "z"]);
    }

    #[test]
    fn respond_requires_complete_session() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        assert!(matches!(
            registry.take_for_response(id),
            Err(RegError::SessionNotReady(_))
        ));
        assert!(matches!(
            registry.take_for_response(99),
            Err(RegError::SessionNotFound(99))
        ));
    }

    #[test]
    fn second_take_sees_not_found() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        complete(&registry, id);

        let (snapshot, _waiter) = registry.take_for_response(id).unwrap();
        assert_eq!(snapshot.phase, Phase::Closed);
        assert_eq!(snapshot.document_name.as_deref(), Some("id.jpg"));
        assert!(matches!(
            registry.take_for_response(id),
            Err(RegError::SessionNotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn taken_waiter_reaches_the_session_task() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        let (waiter, mut directives) = oneshot::channel();
        assert!(registry
            .mark_complete(
                id,
                "id.jpg".into(),
                submitter(),
                PathBuf::from("docs/session-1/id.jpg"),
                waiter,
            )
            .is_ok());

        let (_, waiter) = registry.take_for_response(id).unwrap();
        let (done, _outcome) = oneshot::channel();
        waiter
            .send(Directive::Respond("creds".into(), done))
            .unwrap();
        assert!(matches!(
            directives.try_recv(),
            Ok(Directive::Respond(payload, _)) if payload == "creds"
        ));
    }

    #[test]
    fn taking_one_session_leaves_others_untouched() {
        let registry = SessionRegistry::new();
        let a = registry.register("a".into());
        let b = registry.register("b".into());
        complete(&registry, a);
        registry.set_announced(b, 100);
        registry.set_received(b, 40);

        registry.take_for_response(a).unwrap();

        let b_view = registry.get(b).unwrap();
        assert_eq!(b_view.phase, Phase::Receiving);
        assert_eq!(b_view.received_size, 40);
        assert_eq!(b_view.announced_size, 100);
    }

    #[test]
    fn flagged_session_stays_listed_but_not_ready() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        assert!(registry.flag(id, "bad header".into(), waiter()).is_ok());

        let view = registry.get(id).unwrap();
        assert_eq!(view.phase, Phase::Flagged);
        assert_eq!(view.flag_reason.as_deref(), Some("bad header"));
        assert!(matches!(
            registry.take_for_response(id),
            Err(RegError::SessionNotReady(_))
        ));
        assert!(registry.take_for_disconnect(id).is_ok());
        assert!(!registry.contains(id));
    }

    #[test]
    fn receiving_session_cannot_be_evicted() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        registry.set_announced(id, 5);
        assert!(matches!(
            registry.take_for_disconnect(id),
            Err(RegError::SessionNotReady(_))
        ));
    }

    #[test]
    fn parking_on_removed_session_returns_waiter() {
        let registry = SessionRegistry::new();
        let id = registry.register("peer".into());
        registry.remove(id);
        assert!(!registry.set_announced(id, 3));
        assert!(registry
            .mark_complete(
                id,
                "id.jpg".into(),
                submitter(),
                PathBuf::new(),
                waiter()
            )
            .is_err());
    }

    #[test]
    fn drain_returns_waiters() {
        let registry = SessionRegistry::new();
        let a = registry.register("a".into());
        let b = registry.register("b".into());
        complete(&registry, a);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].1.is_some());
        assert_eq!(drained[1].0, b);
        assert!(drained[1].1.is_none());
        assert!(registry.is_empty());
    }
}
