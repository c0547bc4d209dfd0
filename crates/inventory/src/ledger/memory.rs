use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::ProductId;
use tokio::sync::RwLock;

use super::{
    AuditEntry, AuditStatus, ConfirmPlan, LedgerOp, LedgerOutcome, StockLedger, StockRecord,
    UnfreezePlan, ensure_positive, plan_confirm, plan_refreeze, plan_unfreeze,
};
use crate::error::{InventoryError, Result};

#[derive(Default)]
struct LedgerState {
    records: HashMap<ProductId, StockRecord>,
    audit: HashMap<(i64, ProductId), AuditEntry>,
}

impl LedgerState {
    fn record_mut(&mut self, product_id: ProductId) -> Result<&mut StockRecord> {
        self.records
            .get_mut(&product_id)
            .ok_or(InventoryError::InventoryNotFound(product_id))
    }

    fn apply(&mut self, op: LedgerOp, product_id: ProductId, quantity: i64) -> Result<()> {
        let record = self.record_mut(product_id)?;
        if !record.apply(op, quantity) {
            return Err(InventoryError::NoRowsAffected {
                op,
                product_id,
                quantity,
            });
        }
        Ok(())
    }

    fn set_audit(&mut self, order_ref: i64, product_id: ProductId, quantity: i64, status: AuditStatus) {
        self.audit.insert(
            (order_ref, product_id),
            AuditEntry {
                order_ref,
                product_id,
                quantity,
                status,
                updated_at: Utc::now(),
            },
        );
    }
}

/// In-memory stock ledger.
///
/// Each call holds the write lock for its whole read-check-write, which gives
/// the same all-or-nothing behaviour as the relational conditional updates.
#[derive(Clone, Default)]
pub struct InMemoryStockLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryStockLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of audit entries recorded.
    pub async fn audit_count(&self) -> usize {
        self.state.read().await.audit.len()
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn create(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        if stock < 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id,
                quantity: stock,
            });
        }
        let mut state = self.state.write().await;
        if state.records.contains_key(&product_id) {
            return Err(InventoryError::InventoryExists(product_id));
        }
        let record = StockRecord::new(product_id, stock);
        state.records.insert(product_id, record);
        Ok(record)
    }

    async fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>> {
        Ok(self.state.read().await.records.get(&product_id).copied())
    }

    async fn set_stock(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        if stock < 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id,
                quantity: stock,
            });
        }
        let mut state = self.state.write().await;
        let record = state.record_mut(product_id)?;
        record.stock = stock;
        Ok(*record)
    }

    async fn delete(&self, product_id: ProductId) -> Result<bool> {
        Ok(self.state.write().await.records.remove(&product_id).is_some())
    }

    async fn freeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut state = self.state.write().await;

        if let Some(entry) = state.audit.get(&(order_ref, product_id)) {
            return plan_refreeze(entry);
        }

        state.apply(LedgerOp::Freeze, product_id, quantity)?;
        state.set_audit(order_ref, product_id, quantity, AuditStatus::Pending);
        Ok(LedgerOutcome::Applied)
    }

    async fn unfreeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut state = self.state.write().await;

        let Some(entry) = state.audit.get(&(order_ref, product_id)) else {
            state.set_audit(order_ref, product_id, 0, AuditStatus::Cancelled);
            return Ok(LedgerOutcome::NoOp);
        };

        match plan_unfreeze(entry, quantity)? {
            UnfreezePlan::Skip => Ok(LedgerOutcome::NoOp),
            UnfreezePlan::Release(recorded) => {
                state.apply(LedgerOp::Unfreeze, product_id, recorded)?;
                state.set_audit(order_ref, product_id, recorded, AuditStatus::Cancelled);
                Ok(LedgerOutcome::Applied)
            }
        }
    }

    async fn confirm(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut state = self.state.write().await;

        let entry = state.audit.get(&(order_ref, product_id)).ok_or(
            InventoryError::AuditNotFound {
                order_ref,
                product_id,
            },
        )?;

        match plan_confirm(entry, quantity)? {
            ConfirmPlan::Skip => Ok(LedgerOutcome::NoOp),
            ConfirmPlan::Commit(recorded) => {
                state.apply(LedgerOp::Confirm, product_id, recorded)?;
                state.set_audit(order_ref, product_id, recorded, AuditStatus::Confirmed);
                Ok(LedgerOutcome::Applied)
            }
        }
    }

    async fn cancel_sold(&self, product_id: ProductId, quantity: i64) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut state = self.state.write().await;
        state.apply(LedgerOp::CancelSold, product_id, quantity)?;
        Ok(LedgerOutcome::Applied)
    }

    async fn audit_entry(
        &self,
        order_ref: i64,
        product_id: ProductId,
    ) -> Result<Option<AuditEntry>> {
        Ok(self
            .state
            .read()
            .await
            .audit
            .get(&(order_ref, product_id))
            .cloned())
    }
}
