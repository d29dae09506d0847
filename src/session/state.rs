//! Authoritative per-station session state and the simulation step

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::domain::{
    random_start_soc, ChargePointStatus, ChargeSpeed, DEFAULT_TARGET_SOC,
};

/// Displayed when no charging time estimate applies.
pub const IDLE_TIME_REMAINING: &str = "--:--:--";

/// The open transaction attached to a session.
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub id: i64,
    pub id_tag: String,
    pub meter_start: f64,
    pub started_at: DateTime<Utc>,
}

/// Result of one simulation step for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not charging; nothing advanced.
    Idle,
    /// Charging but already at the target state of charge.
    Pinned,
    /// Energy and state of charge advanced.
    Advanced,
}

/// Server-side authoritative state for one station.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: ChargePointStatus,
    pub vendor: String,
    pub model: String,
    pub transaction: Option<ActiveTransaction>,
    /// Cumulative meter reading for the active transaction, Wh.
    pub energy_wh: f64,
    /// Simulated state of charge, percent.
    pub soc: f64,
    /// State of charge when the active transaction started.
    pub initial_soc: f64,
    /// Operator/app-selected charging ceiling, percent.
    pub target_soc: f64,
    pub charge_speed: Option<ChargeSpeed>,
    pub time_remaining: String,
    /// Basis for simulation deltas.
    pub last_tick: DateTime<Utc>,
}

impl SessionState {
    pub fn new() -> Self {
        let soc = random_start_soc();
        Self {
            status: ChargePointStatus::Connecting,
            vendor: String::new(),
            model: String::new(),
            transaction: None,
            energy_wh: 0.0,
            soc,
            initial_soc: soc,
            target_soc: DEFAULT_TARGET_SOC,
            charge_speed: Some(ChargeSpeed::Normal),
            time_remaining: IDLE_TIME_REMAINING.to_string(),
            last_tick: Utc::now(),
        }
    }

    /// Advance the charging simulation to `now`.
    ///
    /// Never closes the transaction: reaching the target pins the state of
    /// charge and zeroes the time estimate, nothing else.
    pub fn advance(&mut self, now: DateTime<Utc>, battery_capacity_kwh: f64) -> TickOutcome {
        if self.status != ChargePointStatus::Charging || self.transaction.is_none() {
            self.last_tick = now;
            return TickOutcome::Idle;
        }

        if self.soc >= self.target_soc {
            self.soc = self.target_soc;
            self.time_remaining = "00:00:00".to_string();
            self.last_tick = now;
            return TickOutcome::Pinned;
        }

        let elapsed_hours =
            (now - self.last_tick).num_milliseconds().max(0) as f64 / 3_600_000.0;
        self.last_tick = now;

        let power_kw = self
            .charge_speed
            .unwrap_or(ChargeSpeed::Normal)
            .power_kw();
        self.energy_wh += power_kw * 1_000.0 * elapsed_hours;

        let added_soc = self.energy_wh / 1_000.0 / battery_capacity_kwh * 100.0;
        self.soc = (self.initial_soc + added_soc).min(self.target_soc);

        let remaining_kwh = (self.target_soc - self.soc) / 100.0 * battery_capacity_kwh;
        self.time_remaining = format_time_remaining(remaining_kwh / power_kw);

        TickOutcome::Advanced
    }

    /// Close out the active transaction: status Finishing, speed and time
    /// estimate cleared. Does not touch energy/soc (see `reset_baseline`).
    pub fn clear_transaction(&mut self) {
        self.transaction = None;
        self.charge_speed = None;
        self.time_remaining = IDLE_TIME_REMAINING.to_string();
        self.status = ChargePointStatus::Finishing;
    }

    /// Reset simulation fields to a fresh baseline after a transaction
    /// has fully unwound.
    pub fn reset_baseline(&mut self) {
        self.energy_wh = 0.0;
        self.initial_soc = random_start_soc();
        self.soc = self.initial_soc;
        self.time_remaining = IDLE_TIME_REMAINING.to_string();
    }

    pub fn transaction_id(&self) -> Option<i64> {
        self.transaction.as_ref().map(|t| t.id)
    }

    /// JSON view of this state as observers expect it.
    pub fn snapshot(&self, id: &str) -> Value {
        json!({
            "id": id,
            "vendor": self.vendor,
            "model": self.model,
            "status": self.status,
            "transactionId": self.transaction_id(),
            "energy": self.energy_wh,
            "soc": self.soc.round(),
            "targetSoc": self.target_soc,
            "chargeSpeed": self.charge_speed,
            "timeRemaining": self.time_remaining,
        })
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Format an hour count as `HH:MM:SS`.
pub fn format_time_remaining(hours: f64) -> String {
    if !hours.is_finite() || hours < 0.0 {
        return IDLE_TIME_REMAINING.to_string();
    }
    let total_seconds = (hours * 3_600.0).floor() as u64;
    format!(
        "{:02}:{:02}:{:02}",
        total_seconds / 3_600,
        (total_seconds % 3_600) / 60,
        total_seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn charging_state(speed: ChargeSpeed) -> SessionState {
        let mut state = SessionState::new();
        state.initial_soc = 20.0;
        state.soc = 20.0;
        state.status = ChargePointStatus::Charging;
        state.charge_speed = Some(speed);
        state.transaction = Some(ActiveTransaction {
            id: 1,
            id_tag: "TAG1".into(),
            meter_start: 0.0,
            started_at: Utc::now(),
        });
        state
    }

    #[test]
    fn format_hms() {
        assert_eq!(format_time_remaining(1.5), "01:30:00");
        assert_eq!(format_time_remaining(0.0), "00:00:00");
        assert_eq!(format_time_remaining(-1.0), IDLE_TIME_REMAINING);
        assert_eq!(format_time_remaining(f64::INFINITY), IDLE_TIME_REMAINING);
    }

    #[test]
    fn idle_session_does_not_accumulate() {
        let mut state = SessionState::new();
        state.status = ChargePointStatus::Available;
        let now = state.last_tick + Duration::seconds(10);
        assert_eq!(state.advance(now, 42.0), TickOutcome::Idle);
        assert_eq!(state.energy_wh, 0.0);
        assert_eq!(state.last_tick, now);
    }

    #[test]
    fn one_hour_at_normal_speed_adds_rated_energy() {
        let mut state = charging_state(ChargeSpeed::Normal);
        let now = state.last_tick + Duration::hours(1);
        assert_eq!(state.advance(now, 42.0), TickOutcome::Advanced);
        assert!((state.energy_wh - 7_200.0).abs() < 1.0);
        // 7.2 kWh into a 42 kWh battery from 20%
        let expected_soc = 20.0 + 7.2 / 42.0 * 100.0;
        assert!((state.soc - expected_soc).abs() < 0.1);
    }

    #[test]
    fn soc_is_monotonic_and_pins_at_target() {
        let mut state = charging_state(ChargeSpeed::Lightning);
        state.target_soc = 60.0;

        let mut prev_soc = state.soc;
        let mut now = state.last_tick;
        let mut pinned = false;
        for _ in 0..5_000 {
            now += Duration::seconds(1);
            let outcome = state.advance(now, 42.0);
            assert!(state.soc >= prev_soc, "soc must be non-decreasing");
            prev_soc = state.soc;
            if outcome == TickOutcome::Pinned {
                pinned = true;
                break;
            }
        }
        assert!(pinned, "must reach target in finite ticks");
        assert_eq!(state.soc, 60.0);
        assert_eq!(state.time_remaining, "00:00:00");
        assert!(state.transaction.is_some(), "tick never closes a transaction");

        // stays pinned
        now += Duration::seconds(5);
        assert_eq!(state.advance(now, 42.0), TickOutcome::Pinned);
        assert_eq!(state.soc, 60.0);
    }

    #[test]
    fn clear_and_reset_restore_baseline() {
        let mut state = charging_state(ChargeSpeed::Fast);
        state.energy_wh = 9_000.0;
        state.clear_transaction();
        assert_eq!(state.status, ChargePointStatus::Finishing);
        assert!(state.transaction.is_none());
        assert!(state.charge_speed.is_none());

        state.reset_baseline();
        assert_eq!(state.energy_wh, 0.0);
        assert_eq!(state.soc, state.initial_soc);
        assert!((10.0..=50.0).contains(&state.soc));
    }
}
