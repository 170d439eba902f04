//! Stock records owned by the stock ledgers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::{CommodityId, UserId};

/// Quantity of one commodity to deduct or restore for an order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine { pub commodity_id: CommodityId, pub quantity: i64 }

/// Per-commodity stock as kept by the scripted ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItem {
    pub item_id: CommodityId,
    pub stock: i64,
    /// Bumped on every successful deduction or recovery.
    pub version: i64,
    pub modified: DateTime<Utc>,
    pub init_stock: i64,
}

/// One append-only entry of the scripted ledger's per-item log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionLog {
    pub order_id: String,
    pub user_id: UserId,
    pub item_id: CommodityId,
    pub quantity: i64,
    pub old_stock: i64,
    pub new_stock: i64,
    pub timestamp: DateTime<Utc>,
    pub is_rollback: bool,
    /// False for rejected attempts, which leave stock untouched.
    #[serde(default = "succeeded_default")]
    pub succeeded: bool,
}

fn succeeded_default() -> bool { true }

impl DeductionLog {
    /// Signed stock change recorded by this entry.
    pub fn delta(&self) -> i64 { self.new_stock - self.old_stock }
}

/// Stock implied by the initial stock and a complete log.
pub fn replay_stock(init_stock: i64, log: &[DeductionLog]) -> i64 {
    init_stock + log.iter().filter(|e| e.succeeded).map(DeductionLog::delta).sum::<i64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(old: i64, new: i64, is_rollback: bool, succeeded: bool) -> DeductionLog {
        DeductionLog { order_id: "1".into(), user_id: 1, item_id: 1, quantity: (old - new).abs(), old_stock: old, new_stock: new, timestamp: Utc::now(), is_rollback, succeeded }
    }

    #[test]
    fn test_replay_ignores_rejected_attempts() {
        let log = vec![entry(10, 7, false, true), entry(7, 7, false, false), entry(7, 10, true, true), entry(10, 4, false, true)];
        assert_eq!(replay_stock(10, &log), 4);
    }

    #[test]
    fn test_log_entry_defaults_to_succeeded() {
        let json = r#"{"order_id":"1","user_id":2,"item_id":3,"quantity":1,"old_stock":5,"new_stock":4,"timestamp":"2026-01-01T00:00:00Z","is_rollback":false}"#;
        let entry: DeductionLog = serde_json::from_str(json).unwrap();
        assert!(entry.succeeded);
        assert_eq!(entry.delta(), -1);
    }
}
