//! Relational stock ledger with two-phase freeze/confirm/cancel primitives.
//!
//! Each product has one [`StockRecord`]. Reservations move units between the
//! three buckets with conditional updates:
//!
//! ```text
//!            freeze              confirm
//!   stock ───────────► frozen ───────────► sold
//!     ▲                  │                   │
//!     └──── unfreeze ────┘                   │
//!     └──────────────── cancel_sold ─────────┘
//! ```
//!
//! `stock + frozen_stock + sold` is conserved by every pair of moves and no
//! bucket ever goes negative. Freeze, unfreeze and confirm are gated by an
//! [`AuditEntry`] keyed by `(order_ref, product_id)` so retried saga steps are
//! safe.

mod memory;
mod postgres;

pub use memory::InMemoryStockLedger;
pub use postgres::PostgresStockLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ProductId;
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};

/// Stock buckets of one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub product_id: ProductId,
    pub stock: i64,
    pub frozen_stock: i64,
    pub sold: i64,
}

impl StockRecord {
    /// Creates a record with all units available.
    pub fn new(product_id: ProductId, stock: i64) -> Self {
        Self {
            product_id,
            stock,
            frozen_stock: 0,
            sold: 0,
        }
    }

    /// Total units tracked across all buckets.
    pub fn total(&self) -> i64 {
        self.stock + self.frozen_stock + self.sold
    }

    /// Applies a ledger move if its guard holds. Returns false and leaves the
    /// record untouched otherwise.
    pub fn apply(&mut self, op: LedgerOp, quantity: i64) -> bool {
        match op {
            LedgerOp::Freeze if self.stock >= quantity => {
                self.stock -= quantity;
                self.frozen_stock += quantity;
                true
            }
            LedgerOp::Unfreeze if self.frozen_stock >= quantity => {
                self.frozen_stock -= quantity;
                self.stock += quantity;
                true
            }
            LedgerOp::Confirm if self.frozen_stock >= quantity => {
                self.frozen_stock -= quantity;
                self.sold += quantity;
                true
            }
            LedgerOp::CancelSold if self.sold >= quantity => {
                self.sold -= quantity;
                self.stock += quantity;
                true
            }
            _ => false,
        }
    }
}

/// The four conditional ledger moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerOp {
    /// stock → frozen, guarded by stock ≥ qty.
    Freeze,
    /// frozen → stock, guarded by frozen ≥ qty.
    Unfreeze,
    /// frozen → sold, guarded by frozen ≥ qty.
    Confirm,
    /// sold → stock, guarded by sold ≥ qty.
    CancelSold,
}

impl LedgerOp {
    /// Returns the operation name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOp::Freeze => "freeze",
            LedgerOp::Unfreeze => "unfreeze",
            LedgerOp::Confirm => "confirm",
            LedgerOp::CancelSold => "cancel_sold",
        }
    }
}

impl std::fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Phase of a stock reservation.
///
/// ```text
/// PENDING ──┬──► CONFIRMED
///           └──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl AuditStatus {
    /// Returns true for the sticky end states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuditStatus::Confirmed | AuditStatus::Cancelled)
    }

    /// Returns the column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "PENDING",
            AuditStatus::Confirmed => "CONFIRMED",
            AuditStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses a column value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "PENDING" => Ok(AuditStatus::Pending),
            "CONFIRMED" => Ok(AuditStatus::Confirmed),
            "CANCELLED" => Ok(AuditStatus::Cancelled),
            other => Err(InventoryError::Corrupt(format!("audit status {other}"))),
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Idempotency record of one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// The reserving preorder/order id.
    pub order_ref: i64,
    pub product_id: ProductId,
    pub quantity: i64,
    pub status: AuditStatus,
    pub updated_at: DateTime<Utc>,
}

/// Whether a ledger call changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOutcome {
    /// The mutation was applied.
    Applied,
    /// The audit record shows the mutation already happened (or can never
    /// happen); nothing changed.
    NoOp,
}

impl LedgerOutcome {
    /// Returns true if the call changed the ledger.
    pub fn is_applied(&self) -> bool {
        matches!(self, LedgerOutcome::Applied)
    }
}

/// What an audit-gated rollback should do given the current audit row.
pub(crate) enum UnfreezePlan {
    /// Roll back this many frozen units and mark the row CANCELLED.
    Release(i64),
    /// Nothing to do.
    Skip,
}

/// What an audit-gated confirm should do given the current audit row.
pub(crate) enum ConfirmPlan {
    Commit(i64),
    Skip,
}

/// Shared decision logic for the audit gate of unfreeze.
pub(crate) fn plan_unfreeze(entry: &AuditEntry, requested: i64) -> Result<UnfreezePlan> {
    match entry.status {
        AuditStatus::Cancelled => Ok(UnfreezePlan::Skip),
        AuditStatus::Confirmed => Err(InventoryError::AlreadyConfirmed {
            order_ref: entry.order_ref,
            product_id: entry.product_id,
        }),
        AuditStatus::Pending => {
            check_quantity(entry, requested)?;
            Ok(UnfreezePlan::Release(entry.quantity))
        }
    }
}

/// Shared decision logic for the audit gate of confirm.
pub(crate) fn plan_confirm(entry: &AuditEntry, requested: i64) -> Result<ConfirmPlan> {
    match entry.status {
        AuditStatus::Confirmed => Ok(ConfirmPlan::Skip),
        AuditStatus::Cancelled => Err(InventoryError::AlreadyCancelled {
            order_ref: entry.order_ref,
            product_id: entry.product_id,
        }),
        AuditStatus::Pending => {
            check_quantity(entry, requested)?;
            Ok(ConfirmPlan::Commit(entry.quantity))
        }
    }
}

/// Shared decision logic for a freeze that found an existing audit row.
pub(crate) fn plan_refreeze(entry: &AuditEntry) -> Result<LedgerOutcome> {
    match entry.status {
        AuditStatus::Pending | AuditStatus::Confirmed => Ok(LedgerOutcome::NoOp),
        AuditStatus::Cancelled => Err(InventoryError::AlreadyCancelled {
            order_ref: entry.order_ref,
            product_id: entry.product_id,
        }),
    }
}

fn check_quantity(entry: &AuditEntry, requested: i64) -> Result<()> {
    if entry.quantity != requested {
        return Err(InventoryError::QuantityMismatch {
            order_ref: entry.order_ref,
            product_id: entry.product_id,
            recorded: entry.quantity,
            requested,
        });
    }
    Ok(())
}

pub(crate) fn ensure_positive(product_id: ProductId, quantity: i64) -> Result<()> {
    if quantity <= 0 {
        return Err(InventoryError::InvalidQuantity {
            product_id,
            quantity,
        });
    }
    Ok(())
}

/// Storage for stock records and their reservation audit.
///
/// Every mutation is a single conditional update: it either applies in full
/// or reports a typed error, never a bare "zero rows affected".
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Creates the stock record for a new product.
    async fn create(&self, product_id: ProductId, stock: i64) -> Result<StockRecord>;

    /// Loads the stock record for a product.
    async fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>>;

    /// Sets the available stock of a product (restock or correction).
    async fn set_stock(&self, product_id: ProductId, stock: i64) -> Result<StockRecord>;

    /// Deletes the stock record. Returns false if none existed.
    async fn delete(&self, product_id: ProductId) -> Result<bool>;

    /// Moves `quantity` from stock to frozen and opens a PENDING audit entry.
    ///
    /// Repeating the call for a PENDING or CONFIRMED reservation is a no-op;
    /// a CANCELLED reservation cannot be frozen again.
    async fn freeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome>;

    /// Moves the reserved units back from frozen to stock and marks the audit
    /// entry CANCELLED.
    ///
    /// A CANCELLED reservation is a no-op. A CONFIRMED one is rejected with
    /// [`InventoryError::AlreadyConfirmed`]. When no reservation exists yet a
    /// CANCELLED tombstone is written so a late freeze cannot resurrect it.
    async fn unfreeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome>;

    /// Moves the reserved units from frozen to sold and marks the audit entry
    /// CONFIRMED.
    async fn confirm(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome>;

    /// Moves `quantity` from sold back to stock.
    async fn cancel_sold(&self, product_id: ProductId, quantity: i64) -> Result<LedgerOutcome>;

    /// Loads the audit entry of a reservation.
    async fn audit_entry(
        &self,
        order_ref: i64,
        product_id: ProductId,
    ) -> Result<Option<AuditEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: AuditStatus) -> AuditEntry {
        AuditEntry {
            order_ref: 1,
            product_id: ProductId::new(9),
            quantity: 3,
            status,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn record_moves_respect_guards() {
        let mut record = StockRecord::new(ProductId::new(1), 5);
        assert!(record.apply(LedgerOp::Freeze, 3));
        assert!(!record.apply(LedgerOp::Freeze, 3));
        assert!(record.apply(LedgerOp::Confirm, 2));
        assert!(!record.apply(LedgerOp::Unfreeze, 2));
        assert!(record.apply(LedgerOp::Unfreeze, 1));
        assert!(record.apply(LedgerOp::CancelSold, 2));
        assert!(!record.apply(LedgerOp::CancelSold, 1));
        assert_eq!(record, StockRecord::new(ProductId::new(1), 5));
    }

    #[test]
    fn unfreeze_gate() {
        assert!(matches!(
            plan_unfreeze(&entry(AuditStatus::Pending), 3),
            Ok(UnfreezePlan::Release(3))
        ));
        assert!(matches!(
            plan_unfreeze(&entry(AuditStatus::Cancelled), 3),
            Ok(UnfreezePlan::Skip)
        ));
        assert!(matches!(
            plan_unfreeze(&entry(AuditStatus::Confirmed), 3),
            Err(InventoryError::AlreadyConfirmed { .. })
        ));
        assert!(matches!(
            plan_unfreeze(&entry(AuditStatus::Pending), 2),
            Err(InventoryError::QuantityMismatch { .. })
        ));
    }

    #[test]
    fn confirm_gate() {
        assert!(matches!(
            plan_confirm(&entry(AuditStatus::Pending), 3),
            Ok(ConfirmPlan::Commit(3))
        ));
        assert!(matches!(
            plan_confirm(&entry(AuditStatus::Confirmed), 3),
            Ok(ConfirmPlan::Skip)
        ));
        assert!(matches!(
            plan_confirm(&entry(AuditStatus::Cancelled), 3),
            Err(InventoryError::AlreadyCancelled { .. })
        ));
    }

    #[test]
    fn refreeze_gate() {
        assert_eq!(
            plan_refreeze(&entry(AuditStatus::Pending)).unwrap(),
            LedgerOutcome::NoOp
        );
        assert!(plan_refreeze(&entry(AuditStatus::Cancelled)).is_err());
    }

    #[test]
    fn audit_status_parses_column_values() {
        for status in [
            AuditStatus::Pending,
            AuditStatus::Confirmed,
            AuditStatus::Cancelled,
        ] {
            assert_eq!(AuditStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(AuditStatus::parse("DONE").is_err());
        assert!(AuditStatus::Confirmed.is_terminal());
        assert!(!AuditStatus::Pending.is_terminal());
    }
}
