//! SCADA tag bridge
//!
//! Each station exposes a fixed set of named tags toward an industrial
//! integration layer. Most are read-only mirrors of session state; the
//! three `Remote*` tags are writable and act as command triggers. The
//! bridge is a trait so the in-memory implementation used here can be
//! swapped for a real OPC-UA server binding.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::ElectricalParams;

/// Tag names published per station, mirroring the station's live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Status,
    ChargeSpeed,
    Vendor,
    Model,
    TransactionId,
    Soc,
    EnergyKwh,
    PowerTotal,
    ReactivePowerTotal,
    PowerFactor,
    CurrentTotal,
    CurrentA,
    CurrentB,
    CurrentC,
    VoltageAverage,
    VoltageAb,
    VoltageBc,
    VoltageAc,
    RemoteStartTrigger,
    RemoteStopTrigger,
    RemoteStartIdTag,
}

impl Tag {
    pub const ALL: [Tag; 21] = [
        Tag::Status,
        Tag::ChargeSpeed,
        Tag::Vendor,
        Tag::Model,
        Tag::TransactionId,
        Tag::Soc,
        Tag::EnergyKwh,
        Tag::PowerTotal,
        Tag::ReactivePowerTotal,
        Tag::PowerFactor,
        Tag::CurrentTotal,
        Tag::CurrentA,
        Tag::CurrentB,
        Tag::CurrentC,
        Tag::VoltageAverage,
        Tag::VoltageAb,
        Tag::VoltageBc,
        Tag::VoltageAc,
        Tag::RemoteStartTrigger,
        Tag::RemoteStopTrigger,
        Tag::RemoteStartIdTag,
    ];

    /// Published tag name, scoped per station by the bridge.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Status => "Status",
            Tag::ChargeSpeed => "ChargeSpeed",
            Tag::Vendor => "Vendor",
            Tag::Model => "Model",
            Tag::TransactionId => "TransactionID",
            Tag::Soc => "SoC",
            Tag::EnergyKwh => "Energy_kWh",
            Tag::PowerTotal => "Power_Total",
            Tag::ReactivePowerTotal => "ReActivePower_Total",
            Tag::PowerFactor => "PF",
            Tag::CurrentTotal => "Current_Total",
            Tag::CurrentA => "Current_a",
            Tag::CurrentB => "Current_b",
            Tag::CurrentC => "Current_c",
            Tag::VoltageAverage => "Voltage_Average",
            Tag::VoltageAb => "Voltage_ab",
            Tag::VoltageBc => "Voltage_bc",
            Tag::VoltageAc => "Voltage_ac",
            Tag::RemoteStartTrigger => "RemoteStart_Trigger",
            Tag::RemoteStopTrigger => "RemoteStop_Trigger",
            Tag::RemoteStartIdTag => "RemoteStart_IdTag",
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Tag::RemoteStartTrigger | Tag::RemoteStopTrigger | Tag::RemoteStartIdTag
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Flag(bool),
}

impl TagValue {
    pub fn as_flag(&self) -> bool {
        match self {
            TagValue::Flag(b) => *b,
            TagValue::Integer(n) => *n != 0,
            TagValue::Number(n) => *n != 0.0,
            TagValue::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        }
    }
}

/// Commands originating from tag writes on the integration side.
#[derive(Debug, Clone, PartialEq)]
pub enum TagTrigger {
    RemoteStart { station_id: String, id_tag: String },
    RemoteStop { station_id: String },
}

pub type SharedTagBridge = Arc<dyn TagBridge>;

#[async_trait]
pub trait TagBridge: Send + Sync {
    /// Publish the full tag set for a newly provisioned station.
    async fn create_tags_for(&self, station_id: &str);
    /// Retract all tags of a deleted station.
    async fn remove_tags_for(&self, station_id: &str);
    /// Update a single tag's value.
    async fn set_value(&self, station_id: &str, tag: Tag, value: TagValue);
}

/// In-process bridge backing the trait with a concurrent map. External
/// writes arrive through [`InMemoryTagBridge::write`], which fires
/// [`TagTrigger`]s for the writable command tags.
pub struct InMemoryTagBridge {
    values: DashMap<(String, Tag), TagValue>,
    trigger_tx: Option<mpsc::UnboundedSender<TagTrigger>>,
}

impl InMemoryTagBridge {
    pub fn new(trigger_tx: Option<mpsc::UnboundedSender<TagTrigger>>) -> Self {
        Self {
            values: DashMap::new(),
            trigger_tx,
        }
    }

    pub fn get(&self, station_id: &str, tag: Tag) -> Option<TagValue> {
        self.values
            .get(&(station_id.to_string(), tag))
            .map(|v| v.value().clone())
    }

    pub fn has_tags_for(&self, station_id: &str) -> bool {
        self.values.iter().any(|e| e.key().0 == station_id)
    }

    /// A write from the integration side. Rising edges on the trigger tags
    /// become [`TagTrigger`] commands; non-writable tags are rejected.
    pub fn write(&self, station_id: &str, tag: Tag, value: TagValue) -> bool {
        if !tag.is_writable() {
            debug!(station_id, tag = tag.name(), "Rejected write to read-only tag");
            return false;
        }
        let fired = value.as_flag();
        self.values
            .insert((station_id.to_string(), tag), value.clone());

        if fired {
            match tag {
                Tag::RemoteStartTrigger => {
                    let id_tag = match self.get(station_id, Tag::RemoteStartIdTag) {
                        Some(TagValue::Text(s)) if !s.is_empty() => s,
                        _ => "0000".to_string(),
                    };
                    self.fire(TagTrigger::RemoteStart {
                        station_id: station_id.to_string(),
                        id_tag,
                    });
                }
                Tag::RemoteStopTrigger => {
                    self.fire(TagTrigger::RemoteStop {
                        station_id: station_id.to_string(),
                    });
                }
                _ => {}
            }
        }
        true
    }

    fn fire(&self, trigger: TagTrigger) {
        info!(?trigger, "Tag trigger fired");
        if let Some(tx) = &self.trigger_tx {
            let _ = tx.send(trigger);
        }
    }
}

#[async_trait]
impl TagBridge for InMemoryTagBridge {
    async fn create_tags_for(&self, station_id: &str) {
        for tag in Tag::ALL {
            let initial = match tag {
                Tag::Status => TagValue::Text("Connecting".into()),
                Tag::ChargeSpeed | Tag::Vendor | Tag::Model => TagValue::Text(String::new()),
                Tag::TransactionId => TagValue::Integer(0),
                Tag::RemoteStartTrigger | Tag::RemoteStopTrigger => TagValue::Flag(false),
                Tag::RemoteStartIdTag => TagValue::Text("0000".into()),
                _ => TagValue::Number(0.0),
            };
            self.values
                .insert((station_id.to_string(), tag), initial);
        }
        info!(station_id, "Published tag set");
    }

    async fn remove_tags_for(&self, station_id: &str) {
        self.values.retain(|(id, _), _| id != station_id);
        info!(station_id, "Retracted tag set");
    }

    async fn set_value(&self, station_id: &str, tag: Tag, value: TagValue) {
        self.values.insert((station_id.to_string(), tag), value);
    }
}

/// Push one electrical parameter snapshot into the station's tags.
pub async fn publish_electrical(bridge: &dyn TagBridge, station_id: &str, p: &ElectricalParams) {
    let pairs = [
        (Tag::PowerTotal, p.p_total),
        (Tag::ReactivePowerTotal, p.q_total),
        (Tag::PowerFactor, p.pf),
        (Tag::CurrentTotal, p.i_sum),
        (Tag::CurrentA, p.ia),
        (Tag::CurrentB, p.ib),
        (Tag::CurrentC, p.ic),
        (Tag::VoltageAverage, p.v_avg),
        (Tag::VoltageAb, p.vab),
        (Tag::VoltageBc, p.vbc),
        (Tag::VoltageAc, p.vca),
    ];
    for (tag, value) in pairs {
        bridge.set_value(station_id, tag, TagValue::Number(value)).await;
    }
}
