//! Persistence collaborator
//!
//! The engine treats storage as an external collaborator: everything is
//! fire-and-forget except transaction start/stop, which are awaited before
//! the station receives its response. In-memory session state stays
//! authoritative for live operation even when a storage call fails.

pub mod memory;

use async_trait::async_trait;

use crate::domain::{ChargePoint, ChargePointStatus, DomainResult, Transaction};

pub use memory::InMemoryStorage;

/// Storage operations required by the session engine.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn list_stations(&self) -> DomainResult<Vec<ChargePoint>>;
    async fn upsert_station(&self, id: &str, vendor: &str, model: &str) -> DomainResult<()>;
    async fn record_heartbeat(&self, id: &str) -> DomainResult<()>;
    async fn update_status(&self, id: &str, status: ChargePointStatus) -> DomainResult<()>;
    async fn delete_station(&self, id: &str) -> DomainResult<()>;

    async fn start_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
        id_tag: &str,
        meter_start: f64,
    ) -> DomainResult<()>;

    /// Close a transaction. Idempotent: a second stop for the same id is a
    /// no-op and must not overwrite the recorded stop meter.
    async fn stop_transaction(&self, transaction_id: i64, meter_stop: f64) -> DomainResult<()>;

    async fn recent_transactions(&self, limit: usize) -> DomainResult<Vec<Transaction>>;
}
