//! Persistence for preorders, orders and payments.
//!
//! Every state change is a conditional transition: the caller names the
//! states it expects to leave and the store reports whether the guard held.
//! Placing an order promotes the preorder and writes the order row and its
//! items in one unit.

mod memory;
mod postgres;

pub use memory::InMemoryOrderRepository;
pub use postgres::PostgresOrderRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, PreorderId};

use crate::error::{Result, SagaError};
use crate::model::{
    Order, OrderItem, OrderQuery, Payment, PlaceOutcome, Preorder, PreorderItem,
};
use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

/// Storage operations the saga needs.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts a preorder. Returns false if one with the same id exists.
    async fn insert_preorder(&self, preorder: &Preorder) -> Result<bool>;

    /// Loads a preorder.
    async fn preorder(&self, preorder_id: PreorderId) -> Result<Option<Preorder>>;

    /// Deletes a still-pending preorder and its items.
    async fn delete_pending_preorder(&self, preorder_id: PreorderId) -> Result<bool>;

    /// Writes the item snapshot of a preorder. Returns false if already written.
    async fn insert_preorder_item(&self, item: &PreorderItem) -> Result<bool>;

    /// Loads the item snapshots of a preorder.
    async fn preorder_items(&self, preorder_id: PreorderId) -> Result<Vec<PreorderItem>>;

    /// Moves a preorder to `to` if its status is one of `from`.
    async fn transition_preorder(
        &self,
        preorder_id: PreorderId,
        from: &[PreorderStatus],
        to: PreorderStatus,
        reason: Option<&str>,
    ) -> Result<bool>;

    /// Promotes a pending, unexpired preorder and creates its order.
    ///
    /// Returns the existing order if the preorder was already placed.
    async fn place_order(
        &self,
        preorder_id: PreorderId,
        order_id: OrderId,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PlaceOutcome>;

    /// Loads an order.
    async fn order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Loads the order created from a preorder.
    async fn order_by_preorder(&self, preorder_id: PreorderId) -> Result<Option<Order>>;

    /// Loads the lines of an order.
    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    /// Lists a user's orders, newest first.
    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<Order>>;

    /// Moves an order to `to` if its status is one of `from`.
    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Inserts the payment of an order, or returns the one that exists.
    ///
    /// The flag is true when this call created it.
    async fn insert_payment(&self, payment: &Payment) -> Result<(Payment, bool)>;

    /// Loads a payment.
    async fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>>;

    /// Loads the payment of an order.
    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>>;

    /// Moves a payment to `to` if its status is one of `from`.
    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        from: &[PaymentStatus],
        to: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns pending preorders whose expiry has passed, earliest first.
    async fn expired_preorders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PreorderId>>;

    /// Returns unpaid orders whose expiry has passed, earliest first.
    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>>;
}

/// Shared guard for placing a preorder that has no order yet.
pub(crate) fn check_placeable(
    preorder: &Preorder,
    has_items: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    match preorder.status {
        PreorderStatus::Cancelled => Err(SagaError::PreorderExpired(preorder.id)),
        PreorderStatus::Placed => Err(SagaError::PreorderStatusInvalid {
            preorder_id: preorder.id,
            status: preorder.status,
            op: "place",
        }),
        PreorderStatus::Pending if preorder.is_expired(now) => {
            Err(SagaError::PreorderExpired(preorder.id))
        }
        PreorderStatus::Pending if !has_items => Err(SagaError::PreorderNotReady(preorder.id)),
        PreorderStatus::Pending => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{Money, ProductId, UserId};

    fn preorder(status: PreorderStatus, expire_in: Duration) -> Preorder {
        let now = Utc::now();
        Preorder {
            id: PreorderId::new(1),
            user_id: UserId::new(1),
            product_id: ProductId::new(1),
            merchant_id: None,
            quantity: 1,
            unit_price: Money::from_cents(100),
            coupon_id: None,
            original: Money::from_cents(100),
            discount: Money::zero(),
            payable: Money::from_cents(100),
            status,
            snapshot: serde_json::Value::Null,
            cancel_reason: None,
            expire_at: now + expire_in,
            created_at: now,
        }
    }

    #[test]
    fn test_pending_with_items_is_placeable() {
        let p = preorder(PreorderStatus::Pending, Duration::minutes(5));
        assert!(check_placeable(&p, true, Utc::now()).is_ok());
    }

    #[test]
    fn test_missing_items_is_not_ready() {
        let p = preorder(PreorderStatus::Pending, Duration::minutes(5));
        assert!(matches!(
            check_placeable(&p, false, Utc::now()),
            Err(SagaError::PreorderNotReady(_))
        ));
    }

    #[test]
    fn test_expired_or_cancelled_is_rejected() {
        let p = preorder(PreorderStatus::Pending, Duration::minutes(-1));
        assert!(matches!(
            check_placeable(&p, true, Utc::now()),
            Err(SagaError::PreorderExpired(_))
        ));
        let p = preorder(PreorderStatus::Cancelled, Duration::minutes(5));
        assert!(matches!(
            check_placeable(&p, true, Utc::now()),
            Err(SagaError::PreorderExpired(_))
        ));
    }
}
