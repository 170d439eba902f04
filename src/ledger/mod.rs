//! Stock ledgers.
//!
//! A deployment commits to exactly one authoritative ledger. Both strategies
//! expose the same [`StockLedger`] capability: deduct the stock for an
//! order, or recover it after cancellation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::aggregates::{Order, StockLine};
use crate::domain::value_objects::{CommodityId, OrderNo, UserId};
use crate::store::{StoreError, Transaction};

pub mod relational;
pub mod scripted;

pub use relational::RelationalLedger;
pub use scripted::{ScriptError, ScriptStore, ScriptedLedger};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("commodity {commodity_id} is out of stock: {available} left, {requested} requested")]
    StockOut { commodity_id: CommodityId, available: i64, requested: i64 },

    #[error("stock of commodity {commodity_id} is locked by another caller")]
    Locked { commodity_id: CommodityId },

    #[error("commodity {0} has no stock record")]
    CommodityNotFound(CommodityId),

    #[error("order {order_no} already deducted commodity {commodity_id}")]
    DuplicateDeduction { order_no: String, commodity_id: CommodityId },

    #[error("invalid quantity {quantity} for commodity {commodity_id}")]
    InvalidQuantity { commodity_id: CommodityId, quantity: i64 },

    #[error("stock of commodity {0} overflows")]
    Overflow(CommodityId),

    #[error("stock of commodity {0} is already seeded")]
    AlreadySeeded(CommodityId),

    #[error("script setup failed: {0}")]
    ScriptSetup(String),

    #[error("unexpected script reply: {0}")]
    UnexpectedReply(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

/// Which ledger is authoritative for a deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LedgerKind {
    #[default]
    Relational,
    Scripted,
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { Self::Relational => write!(f, "relational"), Self::Scripted => write!(f, "scripted") }
    }
}

impl FromStr for LedgerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" => Ok(Self::Relational),
            "scripted" => Ok(Self::Scripted),
            other => Err(format!("unknown stock ledger {other:?}")),
        }
    }
}

/// Stock to move for one order.
///
/// Lines are merged per commodity and sorted by ascending commodity id,
/// which is the order every ledger visits them in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StockRequest { order_no: OrderNo, user_id: UserId, lines: Vec<StockLine> }

impl StockRequest {
    pub fn new(order_no: OrderNo, user_id: UserId, lines: impl IntoIterator<Item = StockLine>) -> Result<Self, LedgerError> {
        let mut merged: BTreeMap<CommodityId, i64> = BTreeMap::new();
        for line in lines {
            if line.quantity <= 0 {
                return Err(LedgerError::InvalidQuantity { commodity_id: line.commodity_id, quantity: line.quantity });
            }
            let entry = merged.entry(line.commodity_id).or_default();
            *entry = entry.checked_add(line.quantity).ok_or(LedgerError::Overflow(line.commodity_id))?;
        }
        let lines = merged.into_iter().map(|(commodity_id, quantity)| StockLine { commodity_id, quantity }).collect();
        Ok(Self { order_no, user_id, lines })
    }

    pub fn for_order(order: &Order) -> Result<Self, LedgerError> {
        Self::new(order.order_no().clone(), order.user_id(), order.stock_lines())
    }

    pub fn order_no(&self) -> &OrderNo { &self.order_no }
    pub fn user_id(&self) -> UserId { self.user_id }
    pub fn lines(&self) -> &[StockLine] { &self.lines }
}

#[async_trait]
pub trait StockLedger: Send + Sync {
    fn kind(&self) -> LedgerKind;

    /// Deduct every line of `request`.
    ///
    /// The relational ledger writes through `tx`, so its deduction commits or
    /// rolls back with the order. The scripted ledger applies each line
    /// atomically on its own store and undoes already applied lines when a
    /// later one fails.
    async fn deduct(&self, tx: &mut dyn Transaction, request: &StockRequest) -> Result<(), LedgerError>;

    /// Give back the stock of every line of `request`.
    async fn recover(&self, request: &StockRequest) -> Result<(), LedgerError>;
}
