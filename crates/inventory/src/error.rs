use common::{HasStatus, PreorderId, ProductId, StatusCode};
use thiserror::Error;

use crate::admission::Epoch;
use crate::ledger::LedgerOp;

/// Errors that can occur in the stock ledger and the admission controller.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Quantities must be strictly positive.
    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: ProductId, quantity: i64 },

    /// An admission request carried no items.
    #[error("Admission request for preorder {0} has no items")]
    EmptyRequest(PreorderId),

    /// No stock record exists for the product.
    #[error("Inventory not found for product {0}")]
    InventoryNotFound(ProductId),

    /// A stock record already exists for the product.
    #[error("Inventory already exists for product {0}")]
    InventoryExists(ProductId),

    /// A conditional ledger update found its guard false.
    #[error("{op} on product {product_id} affected no rows (quantity {quantity})")]
    NoRowsAffected {
        op: LedgerOp,
        product_id: ProductId,
        quantity: i64,
    },

    /// The reservation was already confirmed and can no longer be rolled back.
    #[error("Reservation {order_ref} for product {product_id} is already confirmed")]
    AlreadyConfirmed { order_ref: i64, product_id: ProductId },

    /// The reservation was already cancelled and can no longer be frozen or confirmed.
    #[error("Reservation {order_ref} for product {product_id} is already cancelled")]
    AlreadyCancelled { order_ref: i64, product_id: ProductId },

    /// No audit entry exists for the reservation.
    #[error("No reservation {order_ref} for product {product_id}")]
    AuditNotFound { order_ref: i64, product_id: ProductId },

    /// The caller's quantity disagrees with the recorded reservation.
    #[error(
        "Reservation {order_ref} for product {product_id} holds {recorded}, request was for {requested}"
    )]
    QuantityMismatch {
        order_ref: i64,
        product_id: ProductId,
        recorded: i64,
        requested: i64,
    },

    /// Admission capacity for the epoch cannot cover the request.
    #[error(
        "Insufficient stock for product {product_id} in epoch {epoch}: requested {requested}, remaining {remaining}"
    )]
    InsufficientStock {
        product_id: ProductId,
        epoch: Epoch,
        requested: i64,
        remaining: i64,
    },

    /// The preorder already holds an admission ticket.
    #[error("Preorder {0} already holds an admission ticket")]
    DuplicateTicket(PreorderId),

    /// No live ticket exists for the preorder.
    #[error("No admission ticket for preorder {0}")]
    TicketNotFound(PreorderId),

    /// Concurrent snapshot refreshes kept invalidating the epoch.
    #[error("Admission epoch for product {0} kept changing, giving up")]
    EpochContention(ProductId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A cache error occurred.
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl InventoryError {
    /// Returns true if the error came from the storage tier rather than a guard.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InventoryError::Database(_)
                | InventoryError::Cache(_)
                | InventoryError::EpochContention(_)
        )
    }
}

impl HasStatus for InventoryError {
    fn status_code(&self) -> StatusCode {
        match self {
            InventoryError::InvalidQuantity { .. }
            | InventoryError::EmptyRequest(_)
            | InventoryError::QuantityMismatch { .. } => StatusCode::InvalidParam,
            InventoryError::InventoryNotFound(_) | InventoryError::AuditNotFound { .. } => {
                StatusCode::NotFound
            }
            InventoryError::InventoryExists(_) => StatusCode::DuplicateRequest,
            InventoryError::NoRowsAffected { .. } => StatusCode::NoRowsAffected,
            InventoryError::AlreadyConfirmed { .. } => StatusCode::StockAlreadyConfirmed,
            InventoryError::AlreadyCancelled { .. } => StatusCode::StockAlreadyCancelled,
            InventoryError::InsufficientStock { .. } => StatusCode::InsufficientStock,
            InventoryError::DuplicateTicket(_) => StatusCode::DuplicateTicket,
            InventoryError::TicketNotFound(_) => StatusCode::TicketNotFound,
            InventoryError::EpochContention(_)
            | InventoryError::Database(_)
            | InventoryError::Migration(_)
            | InventoryError::Cache(_)
            | InventoryError::Serialization(_)
            | InventoryError::Corrupt(_) => StatusCode::InternalError,
        }
    }
}

/// Result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
