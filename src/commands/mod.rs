//! Operator command relay
//!
//! Observers (dashboard, SCADA bridge) issue commands as JSON objects; the
//! relay resolves the target session and either forwards an OCPP Call to
//! the station or, for stop commands against a soft-offline session,
//! compensates locally so the server record closes even though the station
//! is unreachable.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::{ChargePointStatus, ElectricalParams};
use crate::events::{ObserverEvent, SharedObserverHub};
use crate::session::{Session, SharedSessionRegistry, IDLE_TIME_REMAINING};
use crate::storage::Storage;
use crate::tags::{publish_electrical, SharedTagBridge, Tag, TagBridge, TagTrigger, TagValue};

const DEFAULT_REMOTE_ID_TAG: &str = "REMOTE_USER";

/// A command issued by an observer connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommand {
    pub command: String,
    pub charge_point_id: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("charge point {0} is unknown")]
    UnknownChargePoint(String),
    #[error("charge point {0} is not connected")]
    NotConnected(String),
    #[error("unsupported command {0}")]
    Unsupported(String),
    #[error("failed to deliver command to {0}")]
    SendFailed(String),
}

pub struct CommandRelay {
    registry: SharedSessionRegistry,
    storage: Arc<dyn Storage>,
    hub: SharedObserverHub,
    tags: SharedTagBridge,
    settle_delay: Duration,
}

impl CommandRelay {
    pub fn new(
        registry: SharedSessionRegistry,
        storage: Arc<dyn Storage>,
        hub: SharedObserverHub,
        tags: SharedTagBridge,
        settle_delay: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            hub,
            tags,
            settle_delay,
        }
    }

    pub async fn dispatch(&self, command: RemoteCommand) -> Result<(), CommandError> {
        info!(
            command = %command.command,
            station_id = %command.charge_point_id,
            "Operator command"
        );
        match command.command.as_str() {
            "RemoteStartTransaction" => {
                self.remote_start(&command.charge_point_id, &command.params).await
            }
            "RemoteStopTransaction" => self.remote_stop(&command.charge_point_id).await,
            "GetConfiguration" | "ChangeConfiguration" | "ClearCache" | "DataTransfer" => {
                self.forward(&command.charge_point_id, &command.command, command.params)
                    .await
            }
            "DeleteStation" => self.delete_station(&command.charge_point_id).await,
            other => Err(CommandError::Unsupported(other.to_string())),
        }
    }

    /// Map a tag-bridge trigger onto the matching command.
    pub async fn handle_trigger(&self, trigger: TagTrigger) {
        let result = match trigger {
            TagTrigger::RemoteStart { station_id, id_tag } => {
                self.remote_start(&station_id, &json!({ "idTag": id_tag })).await
            }
            TagTrigger::RemoteStop { station_id } => self.remote_stop(&station_id).await,
        };
        if let Err(err) = result {
            warn!(error = %err, "Tag trigger command failed");
        }
    }

    async fn remote_start(&self, station_id: &str, params: &Value) -> Result<(), CommandError> {
        let session = self.connected_session(station_id).await?;
        let id_tag = params
            .get("idTag")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_REMOTE_ID_TAG);

        let mut inner = session.lock().await;
        inner
            .send_call(
                station_id,
                &self.hub,
                "RemoteStartTransaction",
                json!({ "connectorId": 1, "idTag": id_tag }),
                true,
            )
            .ok_or_else(|| CommandError::SendFailed(station_id.to_string()))?;
        Ok(())
    }

    /// Stop the open transaction. Online stations get one
    /// RemoteStopTransaction Call and a settle window during which their
    /// frames are ignored; offline stations are closed out entirely
    /// server-side.
    async fn remote_stop(&self, station_id: &str) -> Result<(), CommandError> {
        let session = self
            .registry
            .get(station_id)
            .ok_or_else(|| CommandError::UnknownChargePoint(station_id.to_string()))?;

        let mut inner = session.lock().await;
        let Some(transaction_id) = inner.state.transaction_id() else {
            info!(station_id, "Remote stop with no open transaction");
            return Ok(());
        };
        let meter_stop = inner.state.energy_wh;
        let connected = inner.is_connected();

        if let Err(err) = self.storage.stop_transaction(transaction_id, meter_stop).await {
            warn!(station_id, error = %err, "Failed to persist remote stop");
        }
        inner.state.clear_transaction();

        if connected {
            inner.force_stopping = true;
            inner.send_call(
                station_id,
                &self.hub,
                "RemoteStopTransaction",
                json!({ "transactionId": transaction_id }),
                true,
            );
        }
        drop(inner);

        self.hub.broadcast(&ObserverEvent::TransactionStop {
            id: station_id.to_string(),
            transaction_id,
        });
        self.tags
            .set_value(station_id, Tag::TransactionId, TagValue::Integer(0))
            .await;

        if connected {
            self.hub.broadcast(&ObserverEvent::Status {
                id: station_id.to_string(),
                status: ChargePointStatus::Finishing.as_str().to_string(),
                electrical_params: ElectricalParams::zero().to_value(),
            });
            self.tags
                .set_value(
                    station_id,
                    Tag::Status,
                    TagValue::Text(ChargePointStatus::Finishing.as_str().to_string()),
                )
                .await;
            schedule_settle(
                session,
                self.hub.clone(),
                self.tags.clone(),
                self.storage.clone(),
                self.settle_delay,
            );
        } else {
            // no station to settle against; close out immediately
            settle_now(&session, &self.hub, &self.tags, self.storage.as_ref()).await;
        }
        Ok(())
    }

    async fn forward(
        &self,
        station_id: &str,
        action: &str,
        params: Value,
    ) -> Result<(), CommandError> {
        let session = self.connected_session(station_id).await?;
        let mut inner = session.lock().await;
        inner
            .send_call(station_id, &self.hub, action, params, true)
            .ok_or_else(|| CommandError::SendFailed(station_id.to_string()))?;
        Ok(())
    }

    /// Hard delete: session, persisted record and tags all go.
    async fn delete_station(&self, station_id: &str) -> Result<(), CommandError> {
        let removed = self.registry.remove(station_id).await;
        if let Err(err) = self.storage.delete_station(station_id).await {
            if !removed {
                return Err(CommandError::UnknownChargePoint(station_id.to_string()));
            }
            warn!(station_id, error = %err, "Station record already gone");
        }
        self.tags.remove_tags_for(station_id).await;
        self.hub.broadcast(&ObserverEvent::Disconnect {
            id: station_id.to_string(),
            hard_delete: Some(true),
        });
        info!(station_id, "Station deleted");
        Ok(())
    }

    async fn connected_session(&self, station_id: &str) -> Result<Arc<Session>, CommandError> {
        let session = self
            .registry
            .get(station_id)
            .ok_or_else(|| CommandError::UnknownChargePoint(station_id.to_string()))?;
        if !session.lock().await.is_connected() {
            return Err(CommandError::NotConnected(station_id.to_string()));
        }
        Ok(session)
    }
}

/// After a stop, hold the `Finishing` status for the settle window, then
/// return the station to `Available` with a fresh simulation baseline.
/// Cancelled implicitly if a new transaction opened in the meantime.
pub fn schedule_settle(
    session: Arc<Session>,
    hub: SharedObserverHub,
    tags: SharedTagBridge,
    storage: Arc<dyn Storage>,
    delay: Duration,
) {
    tokio::spawn(async move {
        sleep(delay).await;
        settle_now(&session, &hub, &tags, storage.as_ref()).await;
    });
}

async fn settle_now(
    session: &Arc<Session>,
    hub: &SharedObserverHub,
    tags: &SharedTagBridge,
    storage: &dyn Storage,
) {
    let mut inner = session.lock().await;
    inner.force_stopping = false;
    if inner.state.transaction.is_some()
        || inner.state.status != ChargePointStatus::Finishing
    {
        return;
    }
    inner.state.status = ChargePointStatus::Available;
    inner.state.reset_baseline();
    let soc = inner.state.soc.round();
    drop(inner);

    let id = session.id.clone();
    let zero = ElectricalParams::zero();
    hub.broadcast(&ObserverEvent::Status {
        id: id.clone(),
        status: ChargePointStatus::Available.as_str().to_string(),
        electrical_params: zero.to_value(),
    });
    hub.broadcast(&ObserverEvent::MeterValue {
        id: id.clone(),
        value: 0.0,
        soc,
        time_remaining: IDLE_TIME_REMAINING.to_string(),
        electrical_params: zero.to_value(),
        ocpp: None,
    });
    hub.broadcast(&ObserverEvent::SpeedUpdate {
        id: id.clone(),
        speed: None,
    });

    tags.set_value(&id, Tag::Status, TagValue::Text("Available".into())).await;
    tags.set_value(&id, Tag::TransactionId, TagValue::Integer(0)).await;
    tags.set_value(&id, Tag::Soc, TagValue::Number(soc)).await;
    tags.set_value(&id, Tag::EnergyKwh, TagValue::Number(0.0)).await;
    publish_electrical(tags.as_ref(), &id, &zero).await;

    if let Err(err) = storage.update_status(&id, ChargePointStatus::Available).await {
        warn!(station_id = %id, error = %err, "Failed to persist settled status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ObserverHub;
    use crate::session::{ActiveTransaction, SessionRegistry};
    use crate::storage::InMemoryStorage;
    use crate::tags::InMemoryTagBridge;
    use chrono::Utc;
    use tokio::sync::mpsc;

    struct Fixture {
        relay: CommandRelay,
        registry: SharedSessionRegistry,
        storage: Arc<InMemoryStorage>,
        tags: SharedTagBridge,
    }

    fn fixture() -> Fixture {
        let registry = SessionRegistry::shared();
        let storage = Arc::new(InMemoryStorage::new());
        let hub = ObserverHub::shared();
        let tags: SharedTagBridge = Arc::new(InMemoryTagBridge::new(None));
        let relay = CommandRelay::new(
            registry.clone(),
            storage.clone(),
            hub,
            tags.clone(),
            Duration::from_millis(20),
        );
        Fixture {
            relay,
            registry,
            storage,
            tags,
        }
    }

    async fn connect(fx: &Fixture, id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        fx.registry.attach(id, tx).await;
        rx
    }

    async fn open_transaction(fx: &Fixture, id: &str, tx_id: i64) {
        fx.storage
            .start_transaction(id, tx_id, "BADGE1", 0.0)
            .await
            .unwrap();
        let session = fx.registry.get(id).unwrap();
        let mut inner = session.lock().await;
        inner.state.status = ChargePointStatus::Charging;
        inner.state.energy_wh = 4_200.0;
        inner.state.transaction = Some(ActiveTransaction {
            id: tx_id,
            id_tag: "BADGE1".into(),
            meter_start: 0.0,
            started_at: Utc::now(),
        });
    }

    fn command(name: &str, id: &str, params: Value) -> RemoteCommand {
        RemoteCommand {
            command: name.into(),
            charge_point_id: id.into(),
            params,
        }
    }

    #[tokio::test]
    async fn remote_start_forwards_call_with_default_id_tag() {
        let fx = fixture();
        let mut rx = connect(&fx, "CP1").await;

        fx.relay
            .dispatch(command("RemoteStartTransaction", "CP1", json!({})))
            .await
            .unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame[2], "RemoteStartTransaction");
        assert_eq!(frame[3]["idTag"], DEFAULT_REMOTE_ID_TAG);
        assert_eq!(frame[3]["connectorId"], 1);
    }

    #[tokio::test]
    async fn remote_start_requires_connection() {
        let fx = fixture();
        let err = fx
            .relay
            .dispatch(command("RemoteStartTransaction", "CP1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownChargePoint(_)));
    }

    #[tokio::test]
    async fn remote_stop_online_sends_one_frame_and_settles() {
        let fx = fixture();
        let mut rx = connect(&fx, "CP1").await;
        open_transaction(&fx, "CP1", 42).await;

        fx.relay
            .dispatch(command("RemoteStopTransaction", "CP1", json!({})))
            .await
            .unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame[2], "RemoteStopTransaction");
        assert_eq!(frame[3]["transactionId"], 42);
        assert!(rx.try_recv().is_err(), "exactly one stop frame");

        let stored = fx.storage.transaction(42).unwrap();
        assert_eq!(stored.meter_stop, Some(4_200.0));

        let session = fx.registry.get("CP1").unwrap();
        {
            let inner = session.lock().await;
            assert!(inner.force_stopping);
            assert_eq!(inner.state.status, ChargePointStatus::Finishing);
        }
        sleep(Duration::from_millis(80)).await;
        let inner = session.lock().await;
        assert!(!inner.force_stopping);
        assert_eq!(inner.state.status, ChargePointStatus::Available);
        assert_eq!(inner.state.energy_wh, 0.0);
    }

    #[tokio::test]
    async fn remote_stop_offline_compensates_locally() {
        let fx = fixture();
        let rx = connect(&fx, "CP1").await;
        open_transaction(&fx, "CP1", 43).await;

        // soft-offline: connection gone, session kept
        let session = fx.registry.get("CP1").unwrap();
        session.lock().await.connection = None;
        drop(rx);

        fx.relay
            .dispatch(command("RemoteStopTransaction", "CP1", json!({})))
            .await
            .unwrap();

        assert!(fx.storage.transaction(43).unwrap().is_closed());
        let inner = session.lock().await;
        assert_eq!(inner.state.status, ChargePointStatus::Available);
        assert!(inner.state.transaction.is_none());
        assert!(!inner.force_stopping);
    }

    #[tokio::test]
    async fn remote_stop_without_transaction_is_a_no_op() {
        let fx = fixture();
        let _rx = connect(&fx, "CP1").await;
        fx.relay
            .dispatch(command("RemoteStopTransaction", "CP1", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_station_clears_everything() {
        let fx = fixture();
        let _rx = connect(&fx, "CP1").await;
        fx.storage.upsert_station("CP1", "AVT", "Mk3").await.unwrap();
        fx.tags.create_tags_for("CP1").await;

        fx.relay
            .dispatch(command("DeleteStation", "CP1", json!({})))
            .await
            .unwrap();

        assert!(fx.registry.get("CP1").is_none());
        assert!(fx.storage.list_stations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_command_is_rejected() {
        let fx = fixture();
        let err = fx
            .relay
            .dispatch(command("Reboot", "CP1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Unsupported(_)));
    }

    #[tokio::test]
    async fn remote_command_deserializes_camel_case() {
        let cmd: RemoteCommand = serde_json::from_str(
            r#"{"command":"RemoteStartTransaction","chargePointId":"CP1","params":{"idTag":"X"}}"#,
        )
        .unwrap();
        assert_eq!(cmd.charge_point_id, "CP1");
        assert_eq!(cmd.params["idTag"], "X");
    }
}
