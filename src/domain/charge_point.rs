//! Charge point status, charging speed and the persisted station record

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session/station status.
///
/// `Offline` is only ever persisted or reported to the telemetry bridge; a
/// live session without a transaction is deleted on disconnect rather than
/// kept in this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Connecting,
    Available,
    Unavailable,
    Preparing,
    Charging,
    Finishing,
    Faulted,
    Offline,
}

impl ChargePointStatus {
    /// Parse a station-reported StatusNotification status.
    ///
    /// The suspended OCPP statuses are outside our closed set and fold into
    /// `Charging`; anything else unknown is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Connecting" => Some(Self::Connecting),
            "Available" => Some(Self::Available),
            "Unavailable" => Some(Self::Unavailable),
            "Preparing" => Some(Self::Preparing),
            "Charging" | "SuspendedEV" | "SuspendedEVSE" => Some(Self::Charging),
            "Finishing" => Some(Self::Finishing),
            "Faulted" => Some(Self::Faulted),
            "Offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::Available => "Available",
            Self::Unavailable => "Unavailable",
            Self::Preparing => "Preparing",
            Self::Charging => "Charging",
            Self::Finishing => "Finishing",
            Self::Faulted => "Faulted",
            Self::Offline => "Offline",
        }
    }

    /// Statuses that keep a session alive across a transport disconnect.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Preparing | Self::Charging | Self::Finishing)
    }
}

impl fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Simulated charging speed, selecting power draw and active phase count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeSpeed {
    Normal,
    Fast,
    Lightning,
}

impl ChargeSpeed {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "fast" => Some(Self::Fast),
            "lightning" => Some(Self::Lightning),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fast => "fast",
            Self::Lightning => "lightning",
        }
    }

    /// Simulated power draw, kW.
    pub fn power_kw(&self) -> f64 {
        match self {
            Self::Normal => 7.2,
            Self::Fast => 14.4,
            Self::Lightning => 21.6,
        }
    }

    /// Number of active phases (normal -> A, fast -> A+B, lightning -> A+B+C).
    pub fn phase_count(&self) -> usize {
        match self {
            Self::Normal => 1,
            Self::Fast => 2,
            Self::Lightning => 3,
        }
    }
}

impl fmt::Display for ChargeSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted station record (the storage collaborator's view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargePoint {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub status: ChargePointStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ChargePoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vendor: String::new(),
            model: String::new(),
            status: ChargePointStatus::Unavailable,
            last_seen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_statuses() {
        assert_eq!(
            ChargePointStatus::parse("Available"),
            Some(ChargePointStatus::Available)
        );
        assert_eq!(
            ChargePointStatus::parse("SuspendedEV"),
            Some(ChargePointStatus::Charging)
        );
        assert_eq!(ChargePointStatus::parse("Reserved"), None);
    }

    #[test]
    fn active_statuses() {
        assert!(ChargePointStatus::Charging.is_active());
        assert!(ChargePointStatus::Preparing.is_active());
        assert!(ChargePointStatus::Finishing.is_active());
        assert!(!ChargePointStatus::Available.is_active());
        assert!(!ChargePointStatus::Offline.is_active());
    }

    #[test]
    fn speed_parameters() {
        assert_eq!(ChargeSpeed::Normal.power_kw(), 7.2);
        assert_eq!(ChargeSpeed::Lightning.phase_count(), 3);
        assert_eq!(ChargeSpeed::parse("fast"), Some(ChargeSpeed::Fast));
        assert_eq!(ChargeSpeed::parse("turbo"), None);
    }

    #[test]
    fn speed_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChargeSpeed::Lightning).unwrap(),
            "\"lightning\""
        );
    }
}
