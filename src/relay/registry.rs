//! # Session Registry
//!
//! Process-wide table of live relay sessions keyed by client identifier.
//!
//! ## Key Features:
//! - **One session per client id**: a second `create` for a live id fails with
//!   `DuplicateClient` and leaves the existing session untouched
//! - **Bounded**: `create` fails with `CapacityReached` at `max_sessions`
//! - **Exactly-once release**: teardown paths racing to remove the same
//!   session remove it once; a stale session never evicts its successor
//! - **Diagnostics**: count and snapshots are read under the same lock that
//!   guards insert/remove, so they never observe a half-applied change
//!
//! The registry is never consulted for routing. The relay loop holds the
//! `Arc<Session>` it was handed at creation.

use crate::error::RelayError;
use crate::relay::session::{Session, SessionSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Lifetime counters, including sessions that are already gone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub opened: u64,
    pub closed: u64,
    pub rejected_duplicate: u64,
    pub rejected_capacity: u64,
    pub frames_from_client: u64,
    pub bytes_from_client: u64,
    pub frames_to_client: u64,
    pub bytes_to_client: u64,
    pub malformed_dropped: u64,
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    rejected_duplicate: AtomicU64,
    rejected_capacity: AtomicU64,
    // Traffic of sessions already released; live sessions are summed on read.
    frames_from_client: AtomicU64,
    bytes_from_client: AtomicU64,
    frames_to_client: AtomicU64,
    bytes_to_client: AtomicU64,
    malformed_dropped: AtomicU64,
}

impl Counters {
    fn absorb(&self, snapshot: &SessionSnapshot) {
        self.frames_from_client.fetch_add(snapshot.frames_from_client, Ordering::Relaxed);
        self.bytes_from_client.fetch_add(snapshot.bytes_from_client, Ordering::Relaxed);
        self.frames_to_client.fetch_add(snapshot.frames_to_client, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(snapshot.bytes_to_client, Ordering::Relaxed);
        self.malformed_dropped.fetch_add(snapshot.malformed_dropped, Ordering::Relaxed);
    }
}

struct Inner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    count_tx: watch::Sender<usize>,
    counters: Counters,
}

/// Shared handle to the session table. Cloning is cheap.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                max_sessions,
                count_tx,
                counters: Counters::default(),
            }),
        }
    }

    /// Register a new session in `Connecting` for `client_id`.
    pub async fn create(&self, client_id: &str) -> Result<Arc<Session>, RelayError> {
        let mut sessions = self.inner.sessions.write().await;

        if sessions.contains_key(client_id) {
            self.inner.counters.rejected_duplicate.fetch_add(1, Ordering::Relaxed);
            warn!(client_id = %client_id, "Rejected duplicate client connection");
            return Err(RelayError::DuplicateClient(client_id.to_string()));
        }
        if sessions.len() >= self.inner.max_sessions {
            self.inner.counters.rejected_capacity.fetch_add(1, Ordering::Relaxed);
            warn!(
                client_id = %client_id,
                limit = self.inner.max_sessions,
                "Rejected connection, session limit reached"
            );
            return Err(RelayError::CapacityReached(self.inner.max_sessions));
        }

        let session = Arc::new(Session::new(client_id.to_string()));
        sessions.insert(client_id.to_string(), session.clone());
        self.inner.count_tx.send_replace(sessions.len());
        self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);

        info!(
            client_id = %client_id,
            session = %session.id(),
            active = sessions.len(),
            "Session registered"
        );
        Ok(session)
    }

    /// Stop the session for `client_id` and wait up to `grace` for its relay
    /// to release it.
    ///
    /// A session still registered after `grace` is evicted by force; its relay
    /// keeps tearing down on its own and its late release is a no-op for the
    /// map. Idempotent: returns `false` when there was nothing to remove.
    pub async fn remove(&self, client_id: &str, grace: Duration) -> bool {
        let Some(session) = self.lookup(client_id).await else {
            return false;
        };

        session.stop();
        if tokio::time::timeout(grace, session.closed()).await.is_ok() {
            debug!(client_id = %client_id, "Session released before removal");
            return true;
        }

        let evicted = {
            let mut sessions = self.inner.sessions.write().await;
            let current = sessions
                .get(client_id)
                .is_some_and(|entry| Arc::ptr_eq(entry, &session));
            if current {
                sessions.remove(client_id);
                self.inner.count_tx.send_replace(sessions.len());
            }
            current
        };
        if evicted {
            warn!(
                client_id = %client_id,
                session = %session.id(),
                "Session did not close within grace, entry evicted"
            );
        }
        true
    }

    /// Remove `session` and mark it `Closed`, exactly once.
    ///
    /// The entry is only removed if it still points at this very session, so
    /// a late release cannot evict a newer session under the same client id.
    pub async fn release(&self, session: &Arc<Session>) -> bool {
        if !session.claim_release() {
            debug!(client_id = %session.client_id(), "Session already released");
            return false;
        }

        {
            let mut sessions = self.inner.sessions.write().await;
            let current = sessions
                .get(session.client_id())
                .is_some_and(|entry| Arc::ptr_eq(entry, session));
            if current {
                sessions.remove(session.client_id());
            }
            self.inner.count_tx.send_replace(sessions.len());
        }

        self.inner.counters.absorb(&session.snapshot());
        self.inner.counters.closed.fetch_add(1, Ordering::Relaxed);
        session.mark_closed();

        info!(
            client_id = %session.client_id(),
            session = %session.id(),
            reason = session.close_reason().map(|r| r.as_str()).unwrap_or("none"),
            "Session closed"
        );
        true
    }

    /// Diagnostics only.
    pub async fn lookup(&self, client_id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().await.get(client_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions = self.inner.sessions.read().await;
        let mut snapshots: Vec<_> = sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    /// Issue a stop request to the session for `client_id`.
    ///
    /// Returns `false` if no such session is registered.
    pub async fn stop(&self, client_id: &str) -> bool {
        match self.lookup(client_id).await {
            Some(session) => {
                if session.stop() {
                    info!(client_id = %client_id, "Stop requested");
                }
                true
            }
            None => false,
        }
    }

    /// Stop every registered session. Returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            session.stop();
        }
        sessions.len()
    }

    /// Wait until no sessions remain, up to `timeout`. Returns whether it emptied.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let mut count = self.inner.count_tx.subscribe();
        let emptied = tokio::time::timeout(timeout, count.wait_for(|n| *n == 0))
            .await
            .is_ok();
        emptied
    }

    pub async fn stats(&self) -> RegistryStats {
        let counters = &self.inner.counters;
        let mut stats = RegistryStats {
            active: 0,
            opened: counters.opened.load(Ordering::Relaxed),
            closed: counters.closed.load(Ordering::Relaxed),
            rejected_duplicate: counters.rejected_duplicate.load(Ordering::Relaxed),
            rejected_capacity: counters.rejected_capacity.load(Ordering::Relaxed),
            frames_from_client: counters.frames_from_client.load(Ordering::Relaxed),
            bytes_from_client: counters.bytes_from_client.load(Ordering::Relaxed),
            frames_to_client: counters.frames_to_client.load(Ordering::Relaxed),
            bytes_to_client: counters.bytes_to_client.load(Ordering::Relaxed),
            malformed_dropped: counters.malformed_dropped.load(Ordering::Relaxed),
        };

        for live in self.snapshots().await {
            stats.active += 1;
            stats.frames_from_client += live.frames_from_client;
            stats.bytes_from_client += live.bytes_from_client;
            stats.frames_to_client += live.frames_to_client;
            stats.bytes_to_client += live.bytes_to_client;
            stats.malformed_dropped += live.malformed_dropped;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::{CloseReason, SessionState};

    #[tokio::test]
    async fn test_duplicate_client_rejected() {
        let registry = SessionRegistry::new(8);
        let first = registry.create("alice").await.unwrap();

        let err = registry.create("alice").await.unwrap_err();
        assert_eq!(err, RelayError::DuplicateClient("alice".into()));

        // The existing session is untouched.
        assert_eq!(first.state(), SessionState::Connecting);
        assert!(first.close_reason().is_none());
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(registry.stats().await.rejected_duplicate, 1);
    }

    #[tokio::test]
    async fn test_create_succeeds_after_release() {
        let registry = SessionRegistry::new(8);
        let first = registry.create("alice").await.unwrap();

        assert!(registry.release(&first).await);
        assert_eq!(first.state(), SessionState::Closed);

        let second = registry.create("alice").await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = SessionRegistry::new(2);
        registry.create("a").await.unwrap();
        registry.create("b").await.unwrap();

        let err = registry.create("c").await.unwrap_err();
        assert_eq!(err, RelayError::CapacityReached(2));
    }

    const GRACE: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new(8);
        let session = registry.create("alice").await.unwrap();

        // Nothing releases this session, so the entry is evicted after grace.
        assert!(registry.remove("alice", GRACE).await);
        assert!(!registry.remove("alice", GRACE).await);
        assert!(!registry.remove("nobody", GRACE).await);
        assert_eq!(session.close_reason(), Some(CloseReason::StopRequested));
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_waits_for_release() {
        let registry = SessionRegistry::new(8);
        let session = registry.create("alice").await.unwrap();

        // Stand-in for a relay loop: release once the stop request lands.
        let relay = {
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move {
                session.cancel_token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.release(&session).await
            })
        };

        assert!(registry.remove("alice", Duration::from_secs(1)).await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(relay.await.unwrap());

        // The id is free only once the old session has fully closed.
        let stats = registry.stats().await;
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.active, 0);
        registry.create("alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_release_removes_once() {
        let registry = SessionRegistry::new(8);
        let session = registry.create("alice").await.unwrap();

        let (a, b) = tokio::join!(registry.release(&session), registry.release(&session));
        assert!(a ^ b, "exactly one release must win");
        assert_eq!(registry.stats().await.closed, 1);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_successor() {
        let registry = SessionRegistry::new(8);
        let old = registry.create("alice").await.unwrap();
        registry.remove("alice", GRACE).await;
        let new = registry.create("alice").await.unwrap();

        registry.release(&old).await;

        let current = registry.lookup("alice").await.unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test]
    async fn test_stop_all_and_wait_empty() {
        let registry = SessionRegistry::new(8);
        let a = registry.create("a").await.unwrap();
        let b = registry.create("b").await.unwrap();

        assert_eq!(registry.stop_all().await, 2);
        assert_eq!(a.close_reason(), Some(CloseReason::StopRequested));
        assert!(!registry.wait_empty(Duration::from_millis(20)).await);

        registry.release(&a).await;
        registry.release(&b).await;
        assert!(registry.wait_empty(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_stop_unknown_client() {
        let registry = SessionRegistry::new(8);
        assert!(!registry.stop("ghost").await);
    }
}
