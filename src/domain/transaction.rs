//! Transaction records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A charging session's billing/metering record, bounded by Start/Stop.
///
/// `meter_stop`/`stop_time` stay `None` until the transaction is closed;
/// closing happens exactly once (see [`crate::storage::Storage`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub charge_point_id: String,
    pub id_tag: String,
    pub meter_start: f64,
    pub meter_stop: Option<f64>,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(
        id: i64,
        charge_point_id: impl Into<String>,
        id_tag: impl Into<String>,
        meter_start: f64,
    ) -> Self {
        Self {
            id,
            charge_point_id: charge_point_id.into(),
            id_tag: id_tag.into(),
            meter_start,
            meter_stop: None,
            start_time: Utc::now(),
            stop_time: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.meter_stop.is_some()
    }
}

/// Server-assigned transaction id, derived from unix time.
pub fn next_transaction_id() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_transaction_is_open() {
        let tx = Transaction::new(1700000000, "CP1", "TAG1", 0.0);
        assert!(!tx.is_closed());
        assert!(tx.stop_time.is_none());
        assert_eq!(tx.meter_start, 0.0);
    }
}
