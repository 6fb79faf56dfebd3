use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use nexus_shared::SessionId;
use tokio::sync::{mpsc, RwLock};

use crate::error::ServerError;
use crate::session::Session;

#[derive(Default)]
struct SessionMaps {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Authenticated user id -> owning session
    by_user: HashMap<String, SessionId>,
}

pub struct SessionRegistry {
    inner: RwLock<SessionMaps>,
    next_id: AtomicU64,
    max_clients: usize,
    send_queue_limit: usize,
}

impl SessionRegistry {
    pub fn new(max_clients: usize, send_queue_limit: usize) -> Self {
        Self {
            inner: RwLock::new(SessionMaps::default()),
            next_id: AtomicU64::new(1),
            max_clients,
            send_queue_limit,
        }
    }

    /// Register a new connection. Fails once `max_clients` sessions are live.
    pub async fn create_session(
        &self,
        peer_addr: SocketAddr,
        accumulator: BytesMut,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<Bytes>), ServerError> {
        let mut inner = self.inner.write().await;
        if inner.sessions.len() >= self.max_clients {
            return Err(ServerError::CapacityExceeded {
                what: "sessions",
                limit: self.max_clients,
            });
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (session, outbound) = Session::new(id, peer_addr, accumulator, self.send_queue_limit);
        let session = Arc::new(session);
        inner.sessions.insert(id, session.clone());
        Ok((session, outbound))
    }

    /// Drop the registry's ownership of a session and any user binding it holds.
    pub async fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let removed = inner.sessions.remove(&id);
        if removed.is_some() {
            inner.by_user.retain(|_, owner| *owner != id);
        }
        removed
    }

    pub async fn find(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(&id).cloned()
    }

    pub async fn find_by_user(&self, user_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .get(user_id)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    /// Claim `user_id` for `session_id`. Fails when another live session
    /// holds it.
    pub async fn bind_user(&self, user_id: &str, session_id: SessionId) -> Result<(), ServerError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&session_id) {
            return Err(ServerError::Internal(format!(
                "session {} is not registered",
                session_id
            )));
        }
        match inner.by_user.get(user_id) {
            Some(owner) if *owner != session_id => Err(ServerError::AlreadyLoggedIn),
            _ => {
                inner.by_user.insert(user_id.to_string(), session_id);
                Ok(())
            }
        }
    }

    /// Release `user_id` if `session_id` still holds it.
    pub async fn unbind_user(&self, user_id: &str, session_id: SessionId) -> bool {
        let mut inner = self.inner.write().await;
        if inner.by_user.get(user_id) == Some(&session_id) {
            inner.by_user.remove(user_id);
            true
        } else {
            false
        }
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn logged_in_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    /// Every live session, ordered by id.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.inner.read().await.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub async fn logged_in_snapshot(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .by_user
            .values()
            .filter_map(|id| inner.sessions.get(id).cloned())
            .collect()
    }

    pub async fn broadcast_to_all(&self, bytes: Bytes) -> usize {
        deliver(self.snapshot().await, bytes).await
    }

    pub async fn broadcast_to_logged_in(&self, bytes: Bytes) -> usize {
        deliver(self.logged_in_snapshot().await, bytes).await
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

async fn deliver(targets: Vec<Arc<Session>>, bytes: Bytes) -> usize {
    let mut delivered = 0;
    for session in targets {
        if session.enqueue_send(bytes.clone()).await {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:6000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_capacity_enforced() {
        let registry = SessionRegistry::new(2, 16);
        let (a, _ra) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        let (b, _rb) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        assert!(b.id() > a.id());

        assert!(matches!(
            registry.create_session(peer(), BytesMut::new()).await,
            Err(ServerError::CapacityExceeded { limit: 2, .. })
        ));

        assert!(registry.remove(a.id()).await.is_some());
        assert!(registry.remove(a.id()).await.is_none());
        let (c, _rc) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        assert!(c.id() > b.id());
        assert_eq!(registry.count().await, 2);
    }

    #[tokio::test]
    async fn test_user_index_follows_bindings() {
        let registry = SessionRegistry::new(10, 16);
        let (a, _ra) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        let (b, _rb) = registry.create_session(peer(), BytesMut::new()).await.unwrap();

        registry.bind_user("alice", a.id()).await.unwrap();
        assert!(matches!(
            registry.bind_user("alice", b.id()).await,
            Err(ServerError::AlreadyLoggedIn)
        ));
        assert_eq!(registry.find_by_user("alice").await.unwrap().id(), a.id());

        assert!(!registry.unbind_user("alice", b.id()).await);
        registry.remove(a.id()).await;
        assert!(registry.find_by_user("alice").await.is_none());
        registry.bind_user("alice", b.id()).await.unwrap();
        assert!(registry.unbind_user("alice", b.id()).await);
        assert_eq!(registry.logged_in_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcasts() {
        let registry = SessionRegistry::new(10, 16);
        let (a, mut ra) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        let (_b, mut rb) = registry.create_session(peer(), BytesMut::new()).await.unwrap();
        registry.bind_user("alice", a.id()).await.unwrap();

        assert_eq!(registry.broadcast_to_all(Bytes::from_static(b"all")).await, 2);
        assert_eq!(ra.try_recv().unwrap(), Bytes::from_static(b"all"));
        assert_eq!(rb.try_recv().unwrap(), Bytes::from_static(b"all"));

        a.on_send_complete().await;
        assert_eq!(
            registry.broadcast_to_logged_in(Bytes::from_static(b"auth")).await,
            1
        );
        assert_eq!(ra.try_recv().unwrap(), Bytes::from_static(b"auth"));
        assert!(rb.try_recv().is_err());
    }
}
