//! Core domain types

pub mod charge_point;
pub mod electrical;
pub mod error;
pub mod transaction;

pub use charge_point::{ChargePoint, ChargePointStatus, ChargeSpeed};
pub use electrical::ElectricalParams;
pub use error::{DomainError, DomainResult};
pub use transaction::{next_transaction_id, Transaction};

/// Simulated vehicle battery capacity, kWh.
pub const BATTERY_CAPACITY_KWH: f64 = 42.0;

/// Default target state of charge, percent.
pub const DEFAULT_TARGET_SOC: f64 = 100.0;

/// Draw the initial state of charge for a fresh session, percent.
pub fn random_start_soc() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(10..=50) as f64
}
