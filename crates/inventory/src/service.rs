//! Inventory service: the stock ledger and admission controller behind one API.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, PreorderId, ProductId};

use crate::admission::{
    AdmissionController, AdmissionItem, AdmissionStore, Epoch, ReturnReport, Ticket,
};
use crate::error::{InventoryError, Result};
use crate::ledger::{AuditEntry, LedgerOp, LedgerOutcome, StockLedger, StockRecord};

/// Service for managing stock and admission.
pub struct InventoryService {
    ledger: Arc<dyn StockLedger>,
    admission: AdmissionController,
}

impl InventoryService {
    /// Creates a new inventory service over the given backends.
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        admission_store: Arc<dyn AdmissionStore>,
        clock: Arc<dyn Clock>,
        ticket_ttl: Duration,
    ) -> Self {
        let admission =
            AdmissionController::new(admission_store, Arc::clone(&ledger), clock, ticket_ttl);
        Self { ledger, admission }
    }

    /// Returns the stock ledger.
    pub fn ledger(&self) -> &Arc<dyn StockLedger> {
        &self.ledger
    }

    /// Returns the admission controller.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Creates the stock record of a new product.
    #[tracing::instrument(skip(self))]
    pub async fn create_inventory(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        let record = self.ledger.create(product_id, stock).await?;
        tracing::info!(%product_id, stock, "Inventory created");
        Ok(record)
    }

    /// Loads the stock record of a product.
    pub async fn get_inventory(&self, product_id: ProductId) -> Result<StockRecord> {
        self.ledger
            .get(product_id)
            .await?
            .ok_or(InventoryError::InventoryNotFound(product_id))
    }

    /// Sets the available stock and rebuilds the admission snapshot from it.
    #[tracing::instrument(skip(self))]
    pub async fn update_inventory(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        let record = self.ledger.set_stock(product_id, stock).await?;
        self.admission.refresh_snapshot(product_id).await?;
        Ok(record)
    }

    /// Deletes the stock record and the product's admission state.
    #[tracing::instrument(skip(self))]
    pub async fn delete_inventory(&self, product_id: ProductId) -> Result<()> {
        if !self.ledger.delete(product_id).await? {
            return Err(InventoryError::InventoryNotFound(product_id));
        }
        self.admission.clear(product_id).await?;
        tracing::info!(%product_id, "Inventory deleted");
        Ok(())
    }

    /// Freezes stock for a preorder.
    #[tracing::instrument(skip(self))]
    pub async fn decrease_pre_inventory(
        &self,
        preorder_id: PreorderId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        let result = self
            .ledger
            .freeze(preorder_id.get(), product_id, quantity)
            .await;
        record(LedgerOp::Freeze, &result);
        result
    }

    /// Confirms frozen stock as sold.
    #[tracing::instrument(skip(self))]
    pub async fn decrease_inventory(
        &self,
        preorder_id: PreorderId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        let result = self
            .ledger
            .confirm(preorder_id.get(), product_id, quantity)
            .await;
        record(LedgerOp::Confirm, &result);
        result
    }

    /// Rolls frozen stock back to available.
    #[tracing::instrument(skip(self))]
    pub async fn return_pre_inventory(
        &self,
        preorder_id: PreorderId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        let result = self
            .ledger
            .unfreeze(preorder_id.get(), product_id, quantity)
            .await;
        record(LedgerOp::Unfreeze, &result);
        result
    }

    /// Moves sold stock back to available (refund/return).
    #[tracing::instrument(skip(self))]
    pub async fn return_inventory(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        let result = self.ledger.cancel_sold(product_id, quantity).await;
        record(LedgerOp::CancelSold, &result);
        result
    }

    /// Grants admission capacity to a preorder.
    pub async fn try_get_token(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<Ticket> {
        self.admission.try_get_token(preorder_id, items).await
    }

    /// Reads, or atomically consumes, a preorder's ticket.
    pub async fn check_token(&self, preorder_id: PreorderId, consume: bool) -> Result<Ticket> {
        self.admission.check_token(preorder_id, consume).await
    }

    /// Returns a preorder's admission capacity.
    pub async fn return_token(
        &self,
        preorder_id: PreorderId,
        items: &[AdmissionItem],
    ) -> Result<ReturnReport> {
        self.admission.return_token(preorder_id, items).await
    }

    /// Rebuilds a product's admission snapshot from the ledger.
    pub async fn refresh_snapshot(&self, product_id: ProductId) -> Result<Epoch> {
        self.admission.refresh_snapshot(product_id).await
    }

    /// Loads the reservation audit entry of a preorder.
    pub async fn audit_entry(
        &self,
        preorder_id: PreorderId,
        product_id: ProductId,
    ) -> Result<Option<AuditEntry>> {
        self.ledger.audit_entry(preorder_id.get(), product_id).await
    }
}

fn record(op: LedgerOp, result: &Result<LedgerOutcome>) {
    let outcome = match result {
        Ok(LedgerOutcome::Applied) => "applied",
        Ok(LedgerOutcome::NoOp) => "noop",
        Err(e) if e.is_transient() => {
            tracing::error!(%op, error = %e, "Ledger mutation failed");
            "error"
        }
        Err(e) => {
            tracing::warn!(%op, error = %e, "Ledger guard rejected mutation");
            "rejected"
        }
    };
    metrics::counter!("ledger_mutations_total", "op" => op.as_str(), "outcome" => outcome)
        .increment(1);
}
