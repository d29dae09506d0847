//! Charging simulation and heartbeat loops
//!
//! The server, not the station, owns the charging trajectory: a periodic
//! tick advances every charging session, publishes the new readings to
//! observers and tags, and pushes a sync frame so connected stations track
//! the server's view. A second loop emits a liveness heartbeat per session.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::domain::{ChargeSpeed, ElectricalParams};
use crate::events::{ObserverEvent, SharedObserverHub};
use crate::handlers::sync_state_payload;
use crate::session::SharedSessionRegistry;
use crate::support::ShutdownSignal;
use crate::tags::{publish_electrical, SharedTagBridge, Tag, TagBridge, TagValue};

pub struct SimulationEngine {
    registry: SharedSessionRegistry,
    hub: SharedObserverHub,
    tags: SharedTagBridge,
    config: SimulationConfig,
}

impl SimulationEngine {
    pub fn new(
        registry: SharedSessionRegistry,
        hub: SharedObserverHub,
        tags: SharedTagBridge,
        config: SimulationConfig,
    ) -> Self {
        Self {
            registry,
            hub,
            tags,
            config,
        }
    }

    /// Drive the charging simulation until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = interval(Duration::from_millis(self.config.tick_interval_ms));
        info!(
            tick_ms = self.config.tick_interval_ms,
            "Simulation loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_once().await,
                _ = shutdown.wait() => {
                    info!("Simulation loop stopped");
                    return;
                }
            }
        }
    }

    /// Emit per-session heartbeats until shutdown.
    pub async fn run_heartbeat(self: Arc<Self>, shutdown: ShutdownSignal) {
        let mut ticker = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for session in self.registry.snapshot() {
                        self.hub.broadcast(&ObserverEvent::Heartbeat {
                            id: session.id.clone(),
                        });
                    }
                }
                _ = shutdown.wait() => return,
            }
        }
    }

    /// Advance every session once. Sessions not charging only refresh their
    /// tick basis.
    pub async fn tick_once(&self) {
        let now = Utc::now();
        for session in self.registry.snapshot() {
            let mut inner = session.lock().await;
            // idle sessions advance nothing but still publish telemetry
            inner.state.advance(now, self.config.battery_capacity_kwh);

            let status = inner.state.status;
            let speed = inner.state.charge_speed.unwrap_or(ChargeSpeed::Normal);
            let energy = inner.state.energy_wh;
            let soc = inner.state.soc.round();
            let time_remaining = inner.state.time_remaining.clone();
            let transaction_id = inner.state.transaction_id();
            let params = ElectricalParams::compute(status, speed);

            // keep a connected station aligned with the server trajectory;
            // these frames are not correlation-tracked
            if inner.is_connected() {
                let payload = sync_state_payload(&inner.state);
                inner.send_call(&session.id, &self.hub, "DataTransfer", payload, false);
            }
            drop(inner);

            debug!(
                station_id = %session.id,
                energy, soc, %time_remaining, "Simulation tick"
            );
            self.hub.broadcast(&ObserverEvent::MeterValue {
                id: session.id.clone(),
                value: energy,
                soc,
                time_remaining: time_remaining.clone(),
                electrical_params: params.to_value(),
                ocpp: Some(meter_values_payload(transaction_id, energy, soc, &params)),
            });

            self.tags
                .set_value(&session.id, Tag::EnergyKwh, TagValue::Number(energy / 1_000.0))
                .await;
            self.tags
                .set_value(&session.id, Tag::Soc, TagValue::Number(soc))
                .await;
            publish_electrical(self.tags.as_ref(), &session.id, &params).await;
        }
    }
}

/// Standard OCPP MeterValues.req payload mirroring the simulated readings.
fn meter_values_payload(
    transaction_id: Option<i64>,
    energy_wh: f64,
    soc: f64,
    params: &ElectricalParams,
) -> Value {
    json!({
        "connectorId": 1,
        "transactionId": transaction_id,
        "meterValue": [{
            "timestamp": Utc::now(),
            "sampledValue": [
                {
                    "value": format!("{energy_wh:.1}"),
                    "measurand": "Energy.Active.Import.Register",
                    "unit": "Wh"
                },
                {
                    "value": format!("{soc:.0}"),
                    "measurand": "SoC",
                    "unit": "Percent"
                },
                {
                    "value": format!("{:.2}", params.p_total),
                    "measurand": "Power.Active.Import",
                    "unit": "kW"
                },
                {
                    "value": format!("{:.1}", params.i_sum),
                    "measurand": "Current.Import",
                    "unit": "A"
                },
                {
                    "value": format!("{:.1}", params.v_avg),
                    "measurand": "Voltage",
                    "unit": "V"
                }
            ]
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChargePointStatus;
    use crate::events::ObserverHub;
    use crate::session::{ActiveTransaction, SessionRegistry};
    use crate::tags::InMemoryTagBridge;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;

    fn engine() -> (Arc<SimulationEngine>, SharedSessionRegistry, SharedObserverHub) {
        let registry = SessionRegistry::shared();
        let hub = ObserverHub::shared();
        let tags: SharedTagBridge = Arc::new(InMemoryTagBridge::new(None));
        let engine = Arc::new(SimulationEngine::new(
            registry.clone(),
            hub.clone(),
            tags,
            SimulationConfig::default(),
        ));
        (engine, registry, hub)
    }

    async fn start_charging(registry: &SharedSessionRegistry, id: &str, backdate_secs: i64) {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.attach(id, tx).await;
        drop(rx);
        let session = registry.get(id).unwrap();
        let mut inner = session.lock().await;
        inner.state.status = ChargePointStatus::Charging;
        inner.state.initial_soc = 20.0;
        inner.state.soc = 20.0;
        inner.state.energy_wh = 0.0;
        inner.state.last_tick = Utc::now() - ChronoDuration::seconds(backdate_secs);
        inner.state.transaction = Some(ActiveTransaction {
            id: 1,
            id_tag: "BADGE1".into(),
            meter_start: 0.0,
            started_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn tick_advances_charging_sessions() {
        let (engine, registry, _hub) = engine();
        start_charging(&registry, "CP1", 3_600).await;

        engine.tick_once().await;

        let session = registry.get("CP1").unwrap();
        let inner = session.lock().await;
        // one hour at normal speed adds 7.2 kWh
        assert!((inner.state.energy_wh - 7_200.0).abs() < 50.0);
        assert!(inner.state.soc > 20.0);
        assert_ne!(inner.state.time_remaining, "--:--:--");
    }

    #[tokio::test]
    async fn idle_sessions_broadcast_telemetry_without_accumulating() {
        let (engine, registry, hub) = engine();
        let (tx, mut station_rx) = mpsc::unbounded_channel();
        registry.attach("CP1", tx).await;
        {
            let session = registry.get("CP1").unwrap();
            let mut inner = session.lock().await;
            inner.state.status = ChargePointStatus::Available;
        }
        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        hub.add(observer_tx);

        engine.tick_once().await;

        let session = registry.get("CP1").unwrap();
        let inner = session.lock().await;
        assert_eq!(inner.state.energy_wh, 0.0);
        assert_eq!(inner.state.time_remaining, "--:--:--");
        drop(inner);

        // every session gets a meterValue event per tick, charging or not
        let mut meter_event = None;
        while let Ok(text) = observer_rx.try_recv() {
            let event: Value = serde_json::from_str(&text).unwrap();
            if event["type"] == "meterValue" {
                meter_event = Some(event);
            }
        }
        let event = meter_event.expect("meterValue event for idle session");
        assert_eq!(event["id"], "CP1");
        assert_eq!(event["value"], 0.0);

        // and a connected idle station still gets its sync frame
        let frame: Value = serde_json::from_str(&station_rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame[2], "DataTransfer");
        assert_eq!(frame[3]["messageId"], "SyncState");
    }

    #[tokio::test]
    async fn many_sessions_progress_independently() {
        let (engine, registry, _hub) = engine();
        for i in 0..50 {
            start_charging(&registry, &format!("CP{i}"), 60 * (i as i64 + 1)).await;
        }

        engine.tick_once().await;
        engine.tick_once().await;

        let mut last_energy = f64::MAX;
        for i in (0..50).rev() {
            let session = registry.get(&format!("CP{i}")).unwrap();
            let inner = session.lock().await;
            // longer backdate means more accumulated energy
            assert!(inner.state.energy_wh > 0.0);
            assert!(inner.state.energy_wh <= last_energy);
            last_energy = inner.state.energy_wh;
        }
    }

    #[tokio::test]
    async fn soc_pins_at_target() {
        let (engine, registry, _hub) = engine();
        start_charging(&registry, "CP1", 0).await;
        {
            let session = registry.get("CP1").unwrap();
            let mut inner = session.lock().await;
            inner.state.target_soc = 50.0;
            inner.state.soc = 50.0;
        }

        engine.tick_once().await;

        let session = registry.get("CP1").unwrap();
        let inner = session.lock().await;
        assert_eq!(inner.state.soc, 50.0);
        assert_eq!(inner.state.time_remaining, "00:00:00");
    }

    #[tokio::test]
    async fn connected_stations_receive_sync_frames() {
        let (engine, registry, _hub) = engine();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach("CP1", tx).await;
        {
            let session = registry.get("CP1").unwrap();
            let mut inner = session.lock().await;
            inner.state.status = ChargePointStatus::Charging;
            inner.state.last_tick = Utc::now() - ChronoDuration::seconds(10);
            inner.state.transaction = Some(ActiveTransaction {
                id: 9,
                id_tag: "BADGE1".into(),
                meter_start: 0.0,
                started_at: Utc::now(),
            });
        }

        engine.tick_once().await;

        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame[2], "DataTransfer");
        assert_eq!(frame[3]["messageId"], "SyncState");
    }
}
