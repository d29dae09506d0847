//! Session registry
//!
//! Single source of truth mapping station id to [`Session`]. The gateway,
//! router, tick engine and relay all share it; none holds a private copy of
//! session state. The map itself is lock-free (`DashMap`), mutation of one
//! session goes through that session's own lock, so independent stations
//! never serialize on each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use super::{Connection, Session, SessionState};

pub type SharedSessionRegistry = Arc<SessionRegistry>;

/// Result of attaching a transport to a station id.
pub struct AttachOutcome {
    pub session: Arc<Session>,
    pub connection_id: u64,
    /// Fired when a newer connection takes over; the caller's read loop
    /// must exit.
    pub superseded: Arc<Notify>,
    /// True when the session already held an open transaction and was kept.
    pub reattached: bool,
}

/// What happened to the session when a transport detached.
#[derive(Debug, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The closing transport was already replaced; nothing to do.
    Stale,
    /// Transaction open: session kept, connection handle cleared
    /// (soft-offline).
    Kept,
    /// No transaction: session deleted from the registry.
    Removed,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    /// Station ids currently mid-provisioning; the gateway rejects their
    /// connections to avoid racing registry setup.
    provisioning: DashSet<String>,
    connection_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            provisioning: DashSet::new(),
            connection_seq: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedSessionRegistry {
        Arc::new(Self::new())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Stable snapshot of all sessions, safe to iterate while connections
    /// attach and detach.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    // ── Provisioning locks ─────────────────────────────────────

    pub fn begin_provisioning(&self, id: &str) -> bool {
        self.provisioning.insert(id.to_string())
    }

    pub fn end_provisioning(&self, id: &str) {
        self.provisioning.remove(id);
    }

    pub fn is_provisioning(&self, id: &str) -> bool {
        self.provisioning.contains(id)
    }

    // ── Attach / detach ────────────────────────────────────────

    /// Attach a transport to the station id, creating or reattaching the
    /// session.
    ///
    /// An existing live connection for the id is superseded (the transport
    /// is replaced, the session never is). A session holding an open
    /// transaction keeps all simulation state; an idle one is reset to a
    /// fresh `Connecting` state.
    pub async fn attach(
        &self,
        id: &str,
        sender: mpsc::UnboundedSender<String>,
    ) -> AttachOutcome {
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Session::new(id)))
            .value()
            .clone();

        let connection_id = self.connection_seq.fetch_add(1, Ordering::SeqCst);
        let connection = Connection::new(connection_id, sender);
        let superseded = connection.superseded.clone();

        let mut inner = session.lock().await;

        if let Some(old) = inner.connection.take() {
            warn!(
                station_id = id,
                old_connection = old.connection_id,
                new_connection = connection_id,
                "Replacing live connection"
            );
            old.superseded.notify_one();
        }

        let reattached = inner.state.transaction.is_some() || inner.state.status.is_active();
        if reattached {
            info!(
                station_id = id,
                status = %inner.state.status,
                transaction_id = ?inner.state.transaction_id(),
                "Reattaching connection to live session"
            );
        } else {
            // idle session: start over
            inner.state = SessionState::new();
            inner.kill_forwarder();
        }
        inner.clear_pending();
        inner.reattached = reattached;
        inner.connection = Some(connection);
        drop(inner);

        AttachOutcome {
            session,
            connection_id,
            superseded,
            reattached,
        }
    }

    /// Detach a transport. Only acts when `connection_id` is still the
    /// session's current connection; a superseded transport detaching late
    /// is a no-op.
    pub async fn detach(&self, id: &str, connection_id: u64) -> DetachOutcome {
        let Some(session) = self.get(id) else {
            return DetachOutcome::Stale;
        };

        let mut inner = session.lock().await;
        if inner.connection_id() != Some(connection_id) {
            return DetachOutcome::Stale;
        }
        inner.connection = None;

        if inner.state.transaction.is_some() || inner.state.status.is_active() {
            info!(
                station_id = id,
                status = %inner.state.status,
                "Connection lost mid-session, keeping session"
            );
            return DetachOutcome::Kept;
        }

        inner.kill_forwarder();
        drop(inner);
        self.sessions.remove(id);
        info!(station_id = id, "Idle station disconnected, session removed");
        DetachOutcome::Removed
    }

    /// Operator hard delete: discard the session, its connection and its
    /// forwarding collaborator.
    pub async fn remove(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        let mut inner = session.lock().await;
        if let Some(conn) = inner.connection.take() {
            conn.superseded.notify_one();
        }
        inner.kill_forwarder();
        info!(station_id = id, "Session hard-deleted");
        true
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChargePointStatus;
    use crate::session::ActiveTransaction;
    use chrono::Utc;

    fn channel() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    async fn start_charging(registry: &SessionRegistry, id: &str) {
        let session = registry.get(id).unwrap();
        let mut inner = session.lock().await;
        inner.state.status = ChargePointStatus::Charging;
        inner.state.energy_wh = 5_000.0;
        inner.state.soc = 35.0;
        inner.state.transaction = Some(ActiveTransaction {
            id: 777,
            id_tag: "TAG1".into(),
            meter_start: 0.0,
            started_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn fresh_attach_creates_session() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let outcome = registry.attach("CP1", tx).await;
        assert!(!outcome.reattached);
        assert_eq!(registry.count(), 1);

        let inner = outcome.session.lock().await;
        assert_eq!(inner.state.status, ChargePointStatus::Connecting);
        assert!(inner.is_connected());
    }

    #[tokio::test]
    async fn idle_disconnect_removes_session() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let outcome = registry.attach("CP1", tx).await;
        assert_eq!(
            registry.detach("CP1", outcome.connection_id).await,
            DetachOutcome::Removed
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn charging_disconnect_keeps_session_state() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        let outcome = registry.attach("CP1", tx).await;
        start_charging(&registry, "CP1").await;

        assert_eq!(
            registry.detach("CP1", outcome.connection_id).await,
            DetachOutcome::Kept
        );
        assert_eq!(registry.count(), 1);

        let session = registry.get("CP1").unwrap();
        let inner = session.lock().await;
        assert!(!inner.is_connected());
        assert_eq!(inner.state.energy_wh, 5_000.0);
        assert_eq!(inner.state.transaction_id(), Some(777));
    }

    #[tokio::test]
    async fn reattach_preserves_transaction_and_supersedes_old_connection() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let first = registry.attach("CP1", tx1).await;
        start_charging(&registry, "CP1").await;
        registry.detach("CP1", first.connection_id).await;

        let (tx2, _rx2) = channel();
        let second = registry.attach("CP1", tx2).await;
        assert!(second.reattached);
        assert_ne!(second.connection_id, first.connection_id);

        let inner = second.session.lock().await;
        assert_eq!(inner.state.transaction_id(), Some(777));
        assert_eq!(inner.state.energy_wh, 5_000.0);
        assert_eq!(inner.state.soc, 35.0);
        assert_eq!(inner.state.status, ChargePointStatus::Charging);
    }

    #[tokio::test]
    async fn attach_over_live_connection_fires_superseded() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let first = registry.attach("CP1", tx1).await;
        let waiter = first.superseded.clone();

        let (tx2, _rx2) = channel();
        let _second = registry.attach("CP1", tx2).await;

        // stored permit: resolves even though we subscribe after the notify
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter.notified())
            .await
            .expect("old connection must be notified");

        // stale detach from the first connection must not touch the session
        assert_eq!(
            registry.detach("CP1", first.connection_id).await,
            DetachOutcome::Stale
        );
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn hard_delete_discards_session() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        registry.attach("CP1", tx).await;
        start_charging(&registry, "CP1").await;

        assert!(registry.remove("CP1").await);
        assert!(!registry.contains("CP1"));
        assert!(!registry.remove("CP1").await);
    }

    #[tokio::test]
    async fn provisioning_lock_roundtrip() {
        let registry = SessionRegistry::new();
        assert!(registry.begin_provisioning("CP1"));
        assert!(registry.is_provisioning("CP1"));
        assert!(!registry.begin_provisioning("CP1"));
        registry.end_provisioning("CP1");
        assert!(!registry.is_provisioning("CP1"));
    }
}
