//! Saga error types.

use common::{HasStatus, OrderId, PaymentId, PreorderId, StatusCode};
use coupon::CouponError;
use inventory::InventoryError;
use thiserror::Error;

use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Preorder not found.
    #[error("Preorder not found: {0}")]
    PreorderNotFound(PreorderId),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// Payment not found.
    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    /// The preorder passed its expiry or was cancelled before it could be placed.
    #[error("Preorder {0} has expired")]
    PreorderExpired(PreorderId),

    /// The preorder's stock has not been frozen yet.
    #[error("Preorder {0} is not ready to be placed")]
    PreorderNotReady(PreorderId),

    /// The preorder is not in a state that allows the operation.
    #[error("Preorder {preorder_id} is {status}, cannot {op}")]
    PreorderStatusInvalid {
        preorder_id: PreorderId,
        status: PreorderStatus,
        op: &'static str,
    },

    /// The order is not in a state that allows the operation.
    #[error("Order {order_id} is {status}, cannot {op}")]
    OrderStatusInvalid {
        order_id: OrderId,
        status: OrderStatus,
        op: &'static str,
    },

    /// The payment is not in a state that allows the operation.
    #[error("Payment {payment_id} is {status}, cannot {op}")]
    PaymentStatusInvalid {
        payment_id: PaymentId,
        status: PaymentStatus,
        op: &'static str,
    },

    /// A checkout for this preorder is already in flight.
    #[error("Checkout for preorder {0} is already in progress")]
    DuplicateRequest(PreorderId),

    /// Inventory service error.
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Coupon service error.
    #[error("Coupon error: {0}")]
    Coupon(#[from] CouponError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The event bus or delay queue rejected a message.
    #[error("Messaging error: {0}")]
    Messaging(String),

    /// Stored data could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl SagaError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Database(_) | SagaError::Messaging(_) => true,
            SagaError::Inventory(e) => e.is_transient(),
            SagaError::Coupon(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl HasStatus for SagaError {
    fn status_code(&self) -> StatusCode {
        match self {
            SagaError::InvalidRequest(_) => StatusCode::InvalidParam,
            SagaError::PreorderNotFound(_)
            | SagaError::OrderNotFound(_)
            | SagaError::PaymentNotFound(_) => StatusCode::NotFound,
            SagaError::PreorderExpired(_) => StatusCode::PreorderExpired,
            SagaError::PreorderNotReady(_) => StatusCode::PreorderNotReady,
            SagaError::PreorderStatusInvalid { .. } | SagaError::OrderStatusInvalid { .. } => {
                StatusCode::OrderStatusInvalid
            }
            SagaError::PaymentStatusInvalid { .. } => StatusCode::PaymentStatusInvalid,
            SagaError::DuplicateRequest(_) => StatusCode::DuplicateRequest,
            SagaError::Inventory(e) => e.status_code(),
            SagaError::Coupon(e) => e.status_code(),
            SagaError::Database(_)
            | SagaError::Migration(_)
            | SagaError::Serialization(_)
            | SagaError::Messaging(_)
            | SagaError::Corrupt(_) => StatusCode::InternalError,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
