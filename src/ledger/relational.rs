//! Pessimistic row-lock ledger.
//!
//! Deduction runs inside the order transaction: lock the stock row, check,
//! write. A stock-out aborts the caller's transaction so nothing of the
//! failed order becomes visible.

use async_trait::async_trait;
use std::sync::Arc;

use super::{LedgerError, LedgerKind, StockLedger, StockRequest};
use crate::store::{Database, Transaction};

pub struct RelationalLedger { db: Arc<dyn Database> }

impl RelationalLedger {
    pub fn new(db: Arc<dyn Database>) -> Self { Self { db } }
}

#[async_trait]
impl StockLedger for RelationalLedger {
    fn kind(&self) -> LedgerKind { LedgerKind::Relational }

    async fn deduct(&self, tx: &mut dyn Transaction, request: &StockRequest) -> Result<(), LedgerError> {
        for line in request.lines() {
            let stock = tx.lock_stock(line.commodity_id).await?.ok_or(LedgerError::CommodityNotFound(line.commodity_id))?;
            let remaining = stock - line.quantity;
            if remaining < 0 {
                tracing::warn!(order_no = %request.order_no(), commodity_id = line.commodity_id, stock, requested = line.quantity, "stock out");
                return Err(LedgerError::StockOut { commodity_id: line.commodity_id, available: stock, requested: line.quantity });
            }
            tx.write_stock(line.commodity_id, remaining).await?;
        }
        Ok(())
    }

    async fn recover(&self, request: &StockRequest) -> Result<(), LedgerError> {
        let mut tx = self.db.begin().await?;
        for line in request.lines() {
            let stock = match tx.lock_stock(line.commodity_id).await {
                Ok(Some(stock)) => stock,
                Ok(None) => {
                    tx.rollback().await?;
                    return Err(LedgerError::CommodityNotFound(line.commodity_id));
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e.into());
                }
            };
            let Some(restored) = stock.checked_add(line.quantity) else {
                tx.rollback().await?;
                return Err(LedgerError::Overflow(line.commodity_id));
            };
            tx.write_stock(line.commodity_id, restored).await?;
        }
        tx.commit().await?;
        tracing::info!(order_no = %request.order_no(), lines = request.lines().len(), "stock recovered");
        Ok(())
    }
}
