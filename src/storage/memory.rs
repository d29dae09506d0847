//! In-memory storage implementation

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::Storage;
use crate::domain::{ChargePoint, ChargePointStatus, DomainError, DomainResult, Transaction};

/// In-memory storage for development and testing.
#[derive(Default)]
pub struct InMemoryStorage {
    stations: DashMap<String, ChargePoint>,
    transactions: DashMap<i64, Transaction>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: fetch a transaction by id.
    pub fn transaction(&self, id: i64) -> Option<Transaction> {
        self.transactions.get(&id).map(|t| t.clone())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list_stations(&self) -> DomainResult<Vec<ChargePoint>> {
        let mut stations: Vec<ChargePoint> =
            self.stations.iter().map(|e| e.value().clone()).collect();
        stations.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stations)
    }

    async fn upsert_station(&self, id: &str, vendor: &str, model: &str) -> DomainResult<()> {
        let mut entry = self
            .stations
            .entry(id.to_string())
            .or_insert_with(|| ChargePoint::new(id));
        if !vendor.is_empty() {
            entry.vendor = vendor.to_string();
        }
        if !model.is_empty() {
            entry.model = model.to_string();
        }
        entry.last_seen = Some(Utc::now());
        Ok(())
    }

    async fn record_heartbeat(&self, id: &str) -> DomainResult<()> {
        if let Some(mut station) = self.stations.get_mut(id) {
            station.last_seen = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_status(&self, id: &str, status: ChargePointStatus) -> DomainResult<()> {
        match self.stations.get_mut(id) {
            Some(mut station) => {
                station.status = status;
                Ok(())
            }
            None => Err(DomainError::ChargePointNotFound(id.to_string())),
        }
    }

    async fn delete_station(&self, id: &str) -> DomainResult<()> {
        self.stations
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DomainError::ChargePointNotFound(id.to_string()))
    }

    async fn start_transaction(
        &self,
        charge_point_id: &str,
        transaction_id: i64,
        id_tag: &str,
        meter_start: f64,
    ) -> DomainResult<()> {
        self.transactions.insert(
            transaction_id,
            Transaction::new(transaction_id, charge_point_id, id_tag, meter_start),
        );
        Ok(())
    }

    async fn stop_transaction(&self, transaction_id: i64, meter_stop: f64) -> DomainResult<()> {
        match self.transactions.get_mut(&transaction_id) {
            Some(mut tx) => {
                if tx.is_closed() {
                    debug!(transaction_id, "Transaction already closed, ignoring stop");
                } else {
                    tx.meter_stop = Some(meter_stop);
                    tx.stop_time = Some(Utc::now());
                }
                Ok(())
            }
            None => Err(DomainError::TransactionNotFound(transaction_id)),
        }
    }

    async fn recent_transactions(&self, limit: usize) -> DomainResult<Vec<Transaction>> {
        let mut all: Vec<Transaction> =
            self.transactions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.truncate(limit);
        Ok(all)
    }
}
