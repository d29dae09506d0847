//! Observer event fan-out
//!
//! Dashboards and SCADA bridges subscribe over WebSocket and receive a JSON
//! event stream. Every event is tagged with a `type` discriminator; field
//! names are camelCase to match what the dashboard expects on the wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type SharedObserverHub = Arc<ObserverHub>;

/// Traffic direction for mirrored OCPP frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Events pushed to observers. Serialized with a `type` tag, e.g.
/// `{"type":"meterValue","id":"CP1",...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObserverEvent {
    /// Sent once to every new observer: all known stations with their live
    /// state merged in.
    #[serde(rename_all = "camelCase")]
    FullStatus { charge_points: Vec<Value> },
    #[serde(rename_all = "camelCase")]
    Connect { id: String, state: Value },
    #[serde(rename_all = "camelCase")]
    Boot { id: String, state: Value },
    #[serde(rename_all = "camelCase")]
    Status {
        id: String,
        status: String,
        electrical_params: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransactionStart {
        id: String,
        transaction_id: i64,
        status: String,
        state: Value,
    },
    #[serde(rename_all = "camelCase")]
    TransactionStop { id: String, transaction_id: i64 },
    #[serde(rename_all = "camelCase")]
    MeterValue {
        id: String,
        value: f64,
        soc: f64,
        time_remaining: String,
        electrical_params: Value,
        /// Standard OCPP MeterValues payload mirrored for protocol-aware
        /// observers; omitted on bare state refreshes.
        #[serde(skip_serializing_if = "Option::is_none")]
        ocpp: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Disconnect {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hard_delete: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    /// `speed` is null when a settled session has no speed selected yet.
    SpeedUpdate { id: String, speed: Option<String> },
    #[serde(rename_all = "camelCase")]
    Heartbeat { id: String },
    /// Mirror of OCPP traffic for the dashboard's log pane. Also carries
    /// command rejections back to the issuing observer.
    #[serde(rename_all = "camelCase")]
    Log {
        charge_point_id: String,
        direction: Direction,
        message: Value,
        timestamp: DateTime<Utc>,
    },
}

/// Registry of observer connections; broadcast is fire-and-forget, a dead
/// observer is pruned on first failed send.
pub struct ObserverHub {
    observers: DashMap<u64, mpsc::UnboundedSender<String>>,
    seq: AtomicU64,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self {
            observers: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    pub fn shared() -> SharedObserverHub {
        Arc::new(Self::new())
    }

    pub fn add(&self, sender: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::SeqCst);
        self.observers.insert(id, sender);
        debug!(observer_id = id, total = self.observers.len(), "Observer attached");
        id
    }

    pub fn remove(&self, id: u64) {
        self.observers.remove(&id);
        debug!(observer_id = id, total = self.observers.len(), "Observer detached");
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Push one event to every observer.
    pub fn broadcast(&self, event: &ObserverEvent) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                debug!(error = %err, "Failed to serialize observer event");
                return;
            }
        };
        self.observers
            .retain(|_, sender| sender.send(text.clone()).is_ok());
    }

    /// Send one event to a single observer, e.g. the initial full status or
    /// a command error meant only for its issuer.
    pub fn send_to(&self, observer_id: u64, event: &ObserverEvent) {
        let Some(sender) = self.observers.get(&observer_id) else {
            return;
        };
        if let Ok(text) = serde_json::to_string(event) {
            let _ = sender.send(text);
        }
    }

    /// Mirror an OCPP frame to the trace log and the observers' log pane.
    pub fn log_traffic(&self, charge_point_id: &str, direction: Direction, frame: &Value) {
        trace!(station_id = charge_point_id, ?direction, %frame, "ocpp frame");
        self.broadcast(&ObserverEvent::Log {
            charge_point_id: charge_point_id.to_string(),
            direction,
            message: frame.clone(),
            timestamp: Utc::now(),
        });
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_reaches_all_observers_and_prunes_dead_ones() {
        let hub = ObserverHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        hub.add(tx1);
        hub.add(tx2);
        drop(rx2);

        hub.broadcast(&ObserverEvent::Heartbeat { id: "CP1".into() });
        let text = rx1.try_recv().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"type": "heartbeat", "id": "CP1"})
        );
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn meter_value_event_uses_camel_case_wire_names() {
        let hub = ObserverHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.add(tx);

        hub.broadcast(&ObserverEvent::MeterValue {
            id: "CP1".into(),
            value: 1234.5,
            soc: 42.5,
            time_remaining: "01:02:03".into(),
            electrical_params: json!({"pTotal": 7.2}),
            ocpp: None,
        });
        let event: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(event["type"], "meterValue");
        assert_eq!(event["timeRemaining"], "01:02:03");
        assert_eq!(event["electricalParams"]["pTotal"], 7.2);
    }

    #[test]
    fn disconnect_omits_hard_delete_when_absent() {
        let event = ObserverEvent::Disconnect {
            id: "CP1".into(),
            hard_delete: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("hardDelete").is_none());

        let event = ObserverEvent::Disconnect {
            id: "CP1".into(),
            hard_delete: Some(true),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["hardDelete"], true);
    }

    #[test]
    fn send_to_targets_a_single_observer() {
        let hub = ObserverHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let id1 = hub.add(tx1);
        hub.add(tx2);

        hub.send_to(id1, &ObserverEvent::Heartbeat { id: "CP1".into() });
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
