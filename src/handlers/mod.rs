//! OCPP-J action router
//!
//! One [`OcppHandler`] is created per station connection. It parses inbound
//! frames, dispatches Calls to per-action handlers and correlates
//! CallResults against the Calls this server issued. The session lock is
//! held across each handler so a frame is always applied against a
//! consistent view of the session.
//!
//! Conflict rule for status reports: the server record wins. While a
//! transaction is open a station-reported `Available` is suppressed, and a
//! `Charging` report with no open transaction likewise; both earn the
//! station a corrective `SyncState` DataTransfer instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::commands::schedule_settle;
use crate::domain::{next_transaction_id, ChargePointStatus, ChargeSpeed, ElectricalParams};
use crate::events::{Direction, ObserverEvent, SharedObserverHub};
use crate::session::{PendingMatch, Session};
use crate::storage::Storage;
use crate::support::OcppFrame;
use crate::tags::{SharedTagBridge, Tag, TagBridge, TagValue};

pub const DATA_TRANSFER_VENDOR: &str = "OCPP_Simulator";

/// Station-to-server actions this server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    BootNotification,
    StatusNotification,
    Heartbeat,
    Authorize,
    StartTransaction,
    StopTransaction,
    MeterValues,
    DataTransfer,
}

impl Action {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "BootNotification" => Some(Action::BootNotification),
            "StatusNotification" => Some(Action::StatusNotification),
            "Heartbeat" => Some(Action::Heartbeat),
            "Authorize" => Some(Action::Authorize),
            "StartTransaction" => Some(Action::StartTransaction),
            "StopTransaction" => Some(Action::StopTransaction),
            "MeterValues" => Some(Action::MeterValues),
            "DataTransfer" => Some(Action::DataTransfer),
            _ => None,
        }
    }
}

pub struct OcppHandler {
    session: Arc<Session>,
    storage: Arc<dyn Storage>,
    hub: SharedObserverHub,
    tags: SharedTagBridge,
    settle_delay: Duration,
    /// Heartbeat interval handed to stations in BootNotification.conf,
    /// seconds.
    boot_interval: u64,
}

impl OcppHandler {
    pub fn new(
        session: Arc<Session>,
        storage: Arc<dyn Storage>,
        hub: SharedObserverHub,
        tags: SharedTagBridge,
        settle_delay: Duration,
        boot_interval: u64,
    ) -> Self {
        Self {
            session,
            storage,
            hub,
            tags,
            settle_delay,
            boot_interval,
        }
    }

    fn station_id(&self) -> &str {
        &self.session.id
    }

    /// Process one inbound frame. Returns the response frame text for the
    /// connection writer, if any.
    pub async fn handle(&self, text: &str) -> Option<String> {
        let frame = match OcppFrame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(station_id = self.station_id(), error = %err, "Dropping malformed frame");
                return None;
            }
        };
        self.hub
            .log_traffic(self.station_id(), Direction::Incoming, &frame.to_value());
        {
            let inner = self.session.lock().await;
            inner.forward(text);
        }

        // every inbound frame counts as liveness, not just Heartbeat
        {
            let storage = self.storage.clone();
            let id = self.station_id().to_string();
            tokio::spawn(async move {
                let _ = storage.record_heartbeat(&id).await;
            });
        }

        let response = match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => self.handle_call(&unique_id, &action, payload).await,
            OcppFrame::CallResult { unique_id, .. } => {
                let mut inner = self.session.lock().await;
                match inner.match_pending(&unique_id) {
                    PendingMatch::Matched(action) => {
                        info!(
                            station_id = self.station_id(),
                            action, "Station acknowledged command"
                        );
                    }
                    PendingMatch::Stale => {}
                    PendingMatch::Unknown => {
                        debug!(
                            station_id = self.station_id(),
                            unique_id, "CallResult without tracked Call"
                        );
                    }
                }
                None
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => {
                let mut inner = self.session.lock().await;
                let _ = inner.match_pending(&unique_id);
                warn!(
                    station_id = self.station_id(),
                    unique_id,
                    error_code,
                    error_description,
                    "Station returned CallError"
                );
                None
            }
        };

        let frame = response?;
        self.hub
            .log_traffic(self.station_id(), Direction::Outgoing, &frame.to_value());
        let text = frame.serialize();
        let inner = self.session.lock().await;
        inner.forward(&text);
        Some(text)
    }

    async fn handle_call(
        &self,
        unique_id: &str,
        action: &str,
        payload: Value,
    ) -> Option<OcppFrame> {
        {
            let inner = self.session.lock().await;
            if inner.force_stopping {
                debug!(
                    station_id = self.station_id(),
                    action, "Ignoring frame during force-stop settle"
                );
                return None;
            }
        }

        let Some(action) = Action::from_name(action) else {
            warn!(station_id = self.station_id(), action, "Unsupported action");
            return Some(OcppFrame::error(
                unique_id,
                "NotImplemented",
                format!("Action {action} is not supported"),
            ));
        };

        match action {
            Action::BootNotification => Some(self.boot_notification(unique_id, payload).await),
            Action::StatusNotification => Some(self.status_notification(unique_id, payload).await),
            Action::Heartbeat => Some(self.heartbeat(unique_id).await),
            Action::Authorize => Some(self.authorize(unique_id, payload)),
            Action::StartTransaction => Some(self.start_transaction(unique_id, payload).await),
            Action::StopTransaction => Some(self.stop_transaction(unique_id, payload).await),
            Action::MeterValues => Some(self.meter_values(unique_id, payload).await),
            Action::DataTransfer => Some(self.data_transfer(unique_id, payload).await),
        }
    }

    // ── BootNotification ───────────────────────────────────────

    async fn boot_notification(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let vendor = str_field(&payload, "chargePointVendor").unwrap_or("Unknown");
        let model = str_field(&payload, "chargePointModel").unwrap_or("Unknown");

        let mut inner = self.session.lock().await;
        inner.state.vendor = vendor.to_string();
        inner.state.model = model.to_string();

        let restoring = inner.reattached && inner.state.transaction.is_some();
        if !restoring && inner.state.status == ChargePointStatus::Connecting {
            inner.state.status = ChargePointStatus::Available;
        }
        let state = inner.state.snapshot(self.station_id());
        let status = inner.state.status;
        info!(
            station_id = self.station_id(),
            vendor, model, restoring, "Boot notification"
        );

        if restoring {
            // hand the open transaction back to the station
            let tx = inner.state.transaction.clone();
            if let Some(tx) = tx {
                let payload = json!({
                    "vendorId": DATA_TRANSFER_VENDOR,
                    "messageId": "RestoreSession",
                    "data": json!({
                        "status": inner.state.status,
                        "transactionId": tx.id,
                        "idTag": tx.id_tag,
                        "soc": inner.state.soc.round(),
                        "energy": inner.state.energy_wh,
                        "targetSoc": inner.state.target_soc,
                        "chargeSpeed": inner.state.charge_speed,
                        "timeRemaining": inner.state.time_remaining,
                    }).to_string(),
                });
                inner.send_call(self.station_id(), &self.hub, "DataTransfer", payload, false);
            }
        }
        drop(inner);

        self.hub.broadcast(&ObserverEvent::Boot {
            id: self.station_id().to_string(),
            state,
        });
        self.tags
            .set_value(self.station_id(), Tag::Vendor, TagValue::Text(vendor.into()))
            .await;
        self.tags
            .set_value(self.station_id(), Tag::Model, TagValue::Text(model.into()))
            .await;
        self.publish_status_tag(status).await;

        let storage = self.storage.clone();
        let (id, vendor, model) = (
            self.station_id().to_string(),
            vendor.to_string(),
            model.to_string(),
        );
        tokio::spawn(async move {
            if let Err(err) = storage.upsert_station(&id, &vendor, &model).await {
                warn!(station_id = %id, error = %err, "Failed to persist station");
            }
        });

        OcppFrame::result(
            unique_id,
            json!({
                "status": "Accepted",
                "currentTime": Utc::now(),
                "interval": self.boot_interval,
            }),
        )
    }

    // ── StatusNotification ─────────────────────────────────────

    async fn status_notification(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let ack = OcppFrame::result(unique_id, json!({}));
        let reported = str_field(&payload, "status");
        let Some(status) = reported.and_then(ChargePointStatus::parse) else {
            warn!(
                station_id = self.station_id(),
                reported, "Unrecognized status report"
            );
            return ack;
        };

        let mut inner = self.session.lock().await;
        let has_transaction = inner.state.transaction.is_some();

        let conflicting = (status == ChargePointStatus::Available && has_transaction)
            || (status == ChargePointStatus::Charging && !has_transaction);
        if conflicting {
            info!(
                station_id = self.station_id(),
                reported = %status,
                server = %inner.state.status,
                "Suppressing conflicting status report"
            );
            self.send_sync_state(&mut inner);
            return ack;
        }

        if status == ChargePointStatus::Faulted && has_transaction {
            // a faulted station cannot keep charging; close out the
            // transaction with the last known meter reading
            let tx_id = inner.state.transaction_id();
            let meter_stop = inner.state.energy_wh;
            inner.state.clear_transaction();
            inner.state.reset_baseline();
            if let Some(tx_id) = tx_id {
                warn!(
                    station_id = self.station_id(),
                    transaction_id = tx_id,
                    "Station faulted mid-transaction, closing it"
                );
                let storage = self.storage.clone();
                tokio::spawn(async move {
                    let _ = storage.stop_transaction(tx_id, meter_stop).await;
                });
                self.hub.broadcast(&ObserverEvent::TransactionStop {
                    id: self.station_id().to_string(),
                    transaction_id: tx_id,
                });
                self.tags
                    .set_value(self.station_id(), Tag::TransactionId, TagValue::Integer(0))
                    .await;
            }
        }

        inner.state.status = status;
        let speed = inner.state.charge_speed.unwrap_or(ChargeSpeed::Normal);
        drop(inner);

        let params = ElectricalParams::compute(status, speed);
        self.hub.broadcast(&ObserverEvent::Status {
            id: self.station_id().to_string(),
            status: status.as_str().to_string(),
            electrical_params: params.to_value(),
        });
        self.publish_status_tag(status).await;

        let storage = self.storage.clone();
        let id = self.station_id().to_string();
        tokio::spawn(async move {
            let _ = storage.update_status(&id, status).await;
        });

        ack
    }

    // ── Heartbeat / Authorize ──────────────────────────────────

    async fn heartbeat(&self, unique_id: &str) -> OcppFrame {
        self.hub.broadcast(&ObserverEvent::Heartbeat {
            id: self.station_id().to_string(),
        });
        OcppFrame::result(unique_id, json!({ "currentTime": Utc::now() }))
    }

    fn authorize(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let id_tag = str_field(&payload, "idTag").unwrap_or("unknown");
        info!(station_id = self.station_id(), id_tag, "Authorize");
        OcppFrame::result(
            unique_id,
            json!({
                "idTagInfo": {
                    "status": "Accepted",
                    "expiryDate": Utc::now() + chrono::Duration::days(365),
                }
            }),
        )
    }

    // ── StartTransaction ───────────────────────────────────────

    async fn start_transaction(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let id_tag = str_field(&payload, "idTag").unwrap_or("unknown").to_string();
        let meter_start = num_field(&payload, "meterStart").unwrap_or(0.0);

        let mut inner = self.session.lock().await;
        if let Some(tx) = &inner.state.transaction {
            warn!(
                station_id = self.station_id(),
                open_transaction = tx.id,
                "StartTransaction while a transaction is open"
            );
            return OcppFrame::result(
                unique_id,
                json!({
                    "transactionId": tx.id,
                    "idTagInfo": { "status": "ConcurrentTx" }
                }),
            );
        }
        if inner.state.status != ChargePointStatus::Preparing {
            warn!(
                station_id = self.station_id(),
                status = %inner.state.status,
                "StartTransaction outside Preparing"
            );
            return OcppFrame::result(
                unique_id,
                json!({
                    "transactionId": 0,
                    "idTagInfo": { "status": "Blocked" }
                }),
            );
        }

        let transaction_id = next_transaction_id();
        // transaction rows must exist before the station learns the id
        if let Err(err) = self
            .storage
            .start_transaction(self.station_id(), transaction_id, &id_tag, meter_start)
            .await
        {
            warn!(station_id = self.station_id(), error = %err, "Failed to record transaction");
            return OcppFrame::result(
                unique_id,
                json!({
                    "transactionId": 0,
                    "idTagInfo": { "status": "Blocked" }
                }),
            );
        }

        let now = Utc::now();
        inner.state.transaction = Some(crate::session::ActiveTransaction {
            id: transaction_id,
            id_tag: id_tag.clone(),
            meter_start,
            started_at: now,
        });
        inner.state.status = ChargePointStatus::Charging;
        inner.state.energy_wh = meter_start;
        inner.state.initial_soc = inner.state.soc;
        inner.state.last_tick = now;
        if inner.state.charge_speed.is_none() {
            inner.state.charge_speed = Some(ChargeSpeed::Normal);
        }
        let state = inner.state.snapshot(self.station_id());
        drop(inner);

        info!(
            station_id = self.station_id(),
            transaction_id, id_tag, meter_start, "Transaction started"
        );
        self.hub.broadcast(&ObserverEvent::TransactionStart {
            id: self.station_id().to_string(),
            transaction_id,
            status: ChargePointStatus::Charging.as_str().to_string(),
            state,
        });
        self.tags
            .set_value(
                self.station_id(),
                Tag::TransactionId,
                TagValue::Integer(transaction_id),
            )
            .await;
        self.publish_status_tag(ChargePointStatus::Charging).await;

        OcppFrame::result(
            unique_id,
            json!({
                "transactionId": transaction_id,
                "idTagInfo": { "status": "Accepted" }
            }),
        )
    }

    // ── StopTransaction ────────────────────────────────────────

    async fn stop_transaction(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let transaction_id = payload
            .get("transactionId")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let meter_stop = num_field(&payload, "meterStop").unwrap_or(0.0);

        let mut inner = self.session.lock().await;
        let matches_open = inner.state.transaction_id() == Some(transaction_id);

        if let Err(err) = self.storage.stop_transaction(transaction_id, meter_stop).await {
            debug!(
                station_id = self.station_id(),
                transaction_id,
                error = %err,
                "Stop for unknown transaction"
            );
        }

        if !matches_open {
            // duplicate or stale stop; acknowledged either way
            return OcppFrame::result(
                unique_id,
                json!({ "idTagInfo": { "status": "Accepted" } }),
            );
        }

        inner.state.clear_transaction();
        drop(inner);

        info!(
            station_id = self.station_id(),
            transaction_id, meter_stop, "Transaction stopped"
        );
        self.hub.broadcast(&ObserverEvent::TransactionStop {
            id: self.station_id().to_string(),
            transaction_id,
        });
        self.hub.broadcast(&ObserverEvent::Status {
            id: self.station_id().to_string(),
            status: ChargePointStatus::Finishing.as_str().to_string(),
            electrical_params: ElectricalParams::zero().to_value(),
        });
        self.tags
            .set_value(self.station_id(), Tag::TransactionId, TagValue::Integer(0))
            .await;
        self.publish_status_tag(ChargePointStatus::Finishing).await;

        schedule_settle(
            self.session.clone(),
            self.hub.clone(),
            self.tags.clone(),
            self.storage.clone(),
            self.settle_delay,
        );

        OcppFrame::result(
            unique_id,
            json!({ "idTagInfo": { "status": "Accepted" } }),
        )
    }

    // ── MeterValues ────────────────────────────────────────────

    async fn meter_values(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let ack = OcppFrame::result(unique_id, json!({}));
        let (energy, soc) = extract_meter_samples(&payload);

        let mut inner = self.session.lock().await;
        if inner.state.transaction.is_none() {
            return ack;
        }
        if let Some(energy) = energy {
            inner.state.energy_wh = energy;
        }
        if let Some(soc) = soc {
            inner.state.soc = soc.min(inner.state.target_soc);
        }
        let status = inner.state.status;
        let speed = inner.state.charge_speed.unwrap_or(ChargeSpeed::Normal);
        let value = inner.state.energy_wh;
        let soc = inner.state.soc;
        let time_remaining = inner.state.time_remaining.clone();
        drop(inner);

        let params = ElectricalParams::compute(status, speed);
        self.hub.broadcast(&ObserverEvent::MeterValue {
            id: self.station_id().to_string(),
            value,
            soc: soc.round(),
            time_remaining,
            electrical_params: params.to_value(),
            ocpp: None,
        });
        self.tags
            .set_value(
                self.station_id(),
                Tag::EnergyKwh,
                TagValue::Number(value / 1_000.0),
            )
            .await;
        self.tags
            .set_value(self.station_id(), Tag::Soc, TagValue::Number(soc.round()))
            .await;
        crate::tags::publish_electrical(self.tags.as_ref(), self.station_id(), &params).await;

        ack
    }

    // ── DataTransfer ───────────────────────────────────────────

    async fn data_transfer(&self, unique_id: &str, payload: Value) -> OcppFrame {
        let message_id = str_field(&payload, "messageId").unwrap_or_default();
        let data = parse_data_field(&payload);

        match message_id {
            "ChargingSpeed" => {
                let Some(speed) = data
                    .get("speed")
                    .and_then(Value::as_str)
                    .and_then(ChargeSpeed::parse)
                else {
                    return OcppFrame::result(unique_id, json!({ "status": "Rejected" }));
                };
                let mut inner = self.session.lock().await;
                inner.state.charge_speed = Some(speed);
                drop(inner);

                info!(station_id = self.station_id(), speed = speed.as_str(), "Charge speed updated");
                self.hub.broadcast(&ObserverEvent::SpeedUpdate {
                    id: self.station_id().to_string(),
                    speed: Some(speed.as_str().to_string()),
                });
                self.tags
                    .set_value(
                        self.station_id(),
                        Tag::ChargeSpeed,
                        TagValue::Text(speed.as_str().to_string()),
                    )
                    .await;
                OcppFrame::result(unique_id, json!({ "status": "Accepted" }))
            }
            "SetTargetSoC" => {
                let Some(target) = data.get("targetSoc").and_then(Value::as_f64) else {
                    return OcppFrame::result(unique_id, json!({ "status": "Rejected" }));
                };
                let mut inner = self.session.lock().await;
                inner.state.target_soc = target.clamp(0.0, 100.0);
                info!(
                    station_id = self.station_id(),
                    target_soc = inner.state.target_soc,
                    "Target SoC updated"
                );
                OcppFrame::result(unique_id, json!({ "status": "Accepted" }))
            }
            "SetInitialSoC" => {
                let Some(initial) = data.get("initialSoc").and_then(Value::as_f64) else {
                    return OcppFrame::result(unique_id, json!({ "status": "Rejected" }));
                };
                let mut inner = self.session.lock().await;
                if inner.state.transaction.is_some() {
                    // baseline only moves between transactions
                    return OcppFrame::result(unique_id, json!({ "status": "Rejected" }));
                }
                inner.state.initial_soc = initial.clamp(0.0, 100.0);
                inner.state.soc = inner.state.initial_soc;
                OcppFrame::result(unique_id, json!({ "status": "Accepted" }))
            }
            other => {
                debug!(
                    station_id = self.station_id(),
                    message_id = other,
                    "Unknown DataTransfer messageId"
                );
                OcppFrame::result(unique_id, json!({ "status": "UnknownMessageId" }))
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────

    /// Push the authoritative session view to the station.
    fn send_sync_state(&self, inner: &mut crate::session::SessionInner) {
        let payload = sync_state_payload(&inner.state);
        inner.send_call(self.station_id(), &self.hub, "DataTransfer", payload, false);
    }

    async fn publish_status_tag(&self, status: ChargePointStatus) {
        self.tags
            .set_value(
                self.station_id(),
                Tag::Status,
                TagValue::Text(status.as_str().to_string()),
            )
            .await;
    }
}

/// DataTransfer payload carrying the server's authoritative session view,
/// pushed to stations that drift out of step.
pub fn sync_state_payload(state: &crate::session::SessionState) -> Value {
    let data = json!({
        "status": state.status,
        "transactionId": state.transaction_id(),
        "soc": state.soc.round(),
        "energy": state.energy_wh,
        "targetSoc": state.target_soc,
        "chargeSpeed": state.charge_speed,
        "timeRemaining": state.time_remaining,
    });
    json!({
        "vendorId": DATA_TRANSFER_VENDOR,
        "messageId": "SyncState",
        "data": data.to_string(),
    })
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn num_field(payload: &Value, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

/// The `data` field of a DataTransfer is a JSON-encoded string per OCPP 1.6,
/// but an inline object is accepted too.
fn parse_data_field(payload: &Value) -> Value {
    match payload.get("data") {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
        Some(value) => value.clone(),
        None => Value::Null,
    }
}

/// Pull the energy register (Wh) and SoC (%) samples out of a MeterValues
/// payload.
fn extract_meter_samples(payload: &Value) -> (Option<f64>, Option<f64>) {
    let mut energy = None;
    let mut soc = None;
    let entries = payload
        .get("meterValue")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for entry in entries {
        let samples = entry
            .get("sampledValue")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for sample in samples {
            let value = sample
                .get("value")
                .and_then(|v| match v {
                    Value::String(s) => s.parse::<f64>().ok(),
                    other => other.as_f64(),
                });
            let Some(value) = value else { continue };
            match sample.get("measurand").and_then(Value::as_str) {
                Some("SoC") => soc = Some(value),
                Some("Energy.Active.Import.Register") | None => energy = Some(value),
                Some(_) => {}
            }
        }
    }
    (energy, soc)
}
