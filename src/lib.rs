//! # OCPP Charge Point Session Engine
//!
//! Central management station for EV charging stations speaking OCPP-J
//! (JSON arrays over WebSocket).
//!
//! ## Architecture
//!
//! - **domain**: core entities (statuses, transactions, electrical read model)
//! - **storage**: persistence collaborator trait + in-memory implementation
//! - **session**: per-station sessions that survive transport disconnects
//! - **handlers**: OCPP-J message router and action handlers
//! - **commands**: operator command relay with offline compensation
//! - **sim**: periodic charging simulation and heartbeat broadcasts
//! - **events**: observer (dashboard/SCADA) broadcast protocol
//! - **tags**: telemetry bridge for external automation (read/write tags)
//! - **forwarder**: optional per-session frame-forwarding child process
//! - **gateway**: WebSocket server accepting station and observer connections

pub mod commands;
pub mod config;
pub mod domain;
pub mod events;
pub mod forwarder;
pub mod gateway;
pub mod handlers;
pub mod sim;
pub mod session;
pub mod storage;
pub mod support;
pub mod tags;

pub use config::{default_config_path, AppConfig};
pub use session::{SessionRegistry, SharedSessionRegistry};
pub use storage::{InMemoryStorage, Storage};
