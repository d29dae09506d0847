//! Live transport handle for a station connection

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

/// An attached WebSocket transport for one station.
///
/// Connections are replaced, sessions are not: a new connection for the same
/// station id fires `superseded` so the old read loop exits and the old
/// socket closes.
#[derive(Debug)]
pub struct Connection {
    /// Monotonic id, unique per process. Correlation ids issued on one
    /// connection are never matched against another.
    pub connection_id: u64,
    /// Outbound frame queue drained by the connection's writer task.
    pub sender: mpsc::UnboundedSender<String>,
    /// Fired when a newer connection takes over this station id.
    pub superseded: Arc<Notify>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Connection {
    pub fn new(connection_id: u64, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            sender,
            superseded: Arc::new(Notify::new()),
            connected_at: now,
            last_activity: now,
        }
    }

    /// Queue a frame for the station. Returns false when the writer task is
    /// gone.
    pub fn send(&self, text: String) -> bool {
        self.sender.send(text).is_ok()
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
