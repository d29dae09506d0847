//! Per-station sessions
//!
//! A [`Session`] is the server-side authoritative record for one station.
//! It outlives any single transport connection: while a transaction is open
//! the session survives disconnects and a new connection is swapped in.
//! All fields live behind one per-session lock so readers never observe a
//! torn combination of transaction/energy/status.

pub mod connection;
pub mod registry;
pub mod state;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::events::{Direction, ObserverHub};
use crate::forwarder::Forwarder;
use crate::support::OcppFrame;

pub use connection::Connection;
pub use registry::{AttachOutcome, DetachOutcome, SessionRegistry, SharedSessionRegistry};
pub use state::{ActiveTransaction, SessionState, TickOutcome, IDLE_TIME_REMAINING};

/// A server-initiated Call awaiting its CallResult.
#[derive(Debug)]
pub struct PendingCall {
    pub connection_id: u64,
    pub action: String,
}

/// Outcome of matching an inbound CallResult against pending Calls.
#[derive(Debug, PartialEq, Eq)]
pub enum PendingMatch {
    /// Issued on the current connection; carries the action name.
    Matched(String),
    /// Issued on a superseded connection, must be ignored.
    Stale,
    /// Never issued (or not tracked, e.g. periodic sync frames).
    Unknown,
}

/// One station's session: connection handle, state and collaborators,
/// guarded together.
pub struct Session {
    pub id: String,
    inner: Mutex<SessionInner>,
}

pub struct SessionInner {
    pub state: SessionState,
    pub connection: Option<Connection>,
    pub forwarder: Option<Forwarder>,
    /// Set when the current connection reattached to a live session.
    pub reattached: bool,
    /// Set while an operator force-stop is unwinding; station frames
    /// received in this window are ignored so a resurrected "Charging"
    /// report cannot re-open the session.
    pub force_stopping: bool,
    pending: HashMap<String, PendingCall>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(SessionInner {
                state: SessionState::new(),
                connection: None,
                forwarder: None,
                reattached: false,
                force_stopping: false,
                pending: HashMap::new(),
            }),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().await
    }
}

impl SessionInner {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.connection_id)
    }

    /// Queue raw text for the station, if connected.
    pub fn send_raw(&self, text: String) -> bool {
        match &self.connection {
            Some(conn) => conn.send(text),
            None => false,
        }
    }

    /// Mirror a frame line to the attached forwarding collaborator.
    pub fn forward(&self, line: &str) {
        if let Some(fw) = &self.forwarder {
            fw.forward(line);
        }
    }

    /// Send a server-initiated Call to the station, logging the traffic and
    /// mirroring it to the forwarder. When `track` is set the unique id is
    /// recorded for CallResult correlation on this connection only.
    ///
    /// Returns the unique id, or `None` when no connection is live.
    pub fn send_call(
        &mut self,
        station_id: &str,
        hub: &ObserverHub,
        action: &str,
        payload: Value,
        track: bool,
    ) -> Option<String> {
        let connection_id = self.connection_id()?;
        let frame = OcppFrame::call(action, payload);
        let unique_id = frame.unique_id().to_string();
        let text = frame.serialize();

        hub.log_traffic(station_id, Direction::Outgoing, &frame.to_value());
        if !self.send_raw(text.clone()) {
            return None;
        }
        self.forward(&text);

        if track {
            self.pending.insert(
                unique_id.clone(),
                PendingCall {
                    connection_id,
                    action: action.to_string(),
                },
            );
        }
        Some(unique_id)
    }

    /// Match an inbound CallResult id against the pending Calls.
    pub fn match_pending(&mut self, unique_id: &str) -> PendingMatch {
        let current = self.connection_id();
        match self.pending.remove(unique_id) {
            Some(call) if Some(call.connection_id) == current => {
                PendingMatch::Matched(call.action)
            }
            Some(call) => {
                debug!(
                    unique_id,
                    stale_connection = call.connection_id,
                    "Dropping CallResult from superseded connection"
                );
                PendingMatch::Stale
            }
            None => PendingMatch::Unknown,
        }
    }

    /// Drop all pending correlation state (connection replaced).
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Tear down the forwarding collaborator, if any.
    pub fn kill_forwarder(&mut self) {
        if let Some(fw) = self.forwarder.take() {
            fw.shutdown();
        }
    }
}
