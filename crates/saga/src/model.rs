//! Preorder, order and payment records plus the saga's request/response types.

use chrono::{DateTime, Utc};
use common::{CouponId, MerchantId, Money, OrderId, PaymentId, PreorderId, ProductId, UserId};
use serde::{Deserialize, Serialize};

use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

/// A preorder: one product line held for a user while stock is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preorder {
    pub id: PreorderId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub merchant_id: Option<MerchantId>,
    pub quantity: i64,
    pub unit_price: Money,
    pub coupon_id: Option<CouponId>,
    pub original: Money,
    pub discount: Money,
    pub payable: Money,
    pub status: PreorderStatus,
    pub snapshot: serde_json::Value,
    pub cancel_reason: Option<String>,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Preorder {
    /// Returns true if the preorder's window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_at
    }
}

/// The product snapshot written once stock is frozen for a preorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreorderItem {
    pub preorder_id: PreorderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Money,
    pub snapshot: serde_json::Value,
}

/// An order, created exactly once per preorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub preorder_id: PreorderId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub coupon_id: Option<CouponId>,
    pub original: Money,
    pub discount: Money,
    pub payable: Money,
    pub status: OrderStatus,
    pub cancel_reason: Option<String>,
    pub expire_time: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds the order row for a placed preorder.
    pub fn from_preorder(
        id: OrderId,
        preorder: &Preorder,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            preorder_id: preorder.id,
            user_id: preorder.user_id,
            product_id: preorder.product_id,
            quantity: preorder.quantity,
            coupon_id: preorder.coupon_id,
            original: preorder.original,
            discount: preorder.discount,
            payable: preorder.payable,
            status: OrderStatus::PendingPayment,
            cancel_reason: None,
            expire_time,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A line of an order, copied from the preorder item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Money,
    pub snapshot: serde_json::Value,
}

/// A payment; at most one per order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub amount: Money,
    pub status: PaymentStatus,
    pub expire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A checkout request for a single product line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Client-supplied idempotency key; generated when absent.
    #[serde(default)]
    pub preorder_id: Option<PreorderId>,
    pub user_id: UserId,
    pub product_id: ProductId,
    #[serde(default)]
    pub merchant_id: Option<MerchantId>,
    pub quantity: i64,
    pub unit_price: Money,
    #[serde(default)]
    pub coupon_id: Option<CouponId>,
    #[serde(default)]
    pub snapshot: serde_json::Value,
}

/// What a checkout committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub preorder_id: PreorderId,
    pub original: Money,
    pub discount: Money,
    pub payable: Money,
    pub expire_at: DateTime<Utc>,
    /// Set when the preorder already existed and nothing new was reserved.
    pub duplicate: bool,
}

impl CheckoutReceipt {
    pub(crate) fn for_preorder(preorder: &Preorder, duplicate: bool) -> Self {
        Self {
            preorder_id: preorder.id,
            original: preorder.original,
            discount: preorder.discount,
            payable: preorder.payable,
            expire_at: preorder.expire_at,
            duplicate,
        }
    }
}

/// Payload of the checkout topic, consumed by the pre-freeze step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutEvent {
    pub preorder_id: PreorderId,
    pub user_id: UserId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub price_cents: i64,
    pub snapshot: serde_json::Value,
}

impl From<&Preorder> for CheckoutEvent {
    fn from(preorder: &Preorder) -> Self {
        Self {
            preorder_id: preorder.id,
            user_id: preorder.user_id,
            product_id: preorder.product_id,
            quantity: preorder.quantity,
            price_cents: preorder.unit_price.cents(),
            snapshot: preorder.snapshot.clone(),
        }
    }
}

/// Result of placing an order.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaceOutcome {
    /// The preorder was promoted and a new order row written.
    Created(Order),
    /// The preorder had already been placed; this is its order.
    Existing(Order),
}

impl PlaceOutcome {
    /// Returns the order either way.
    pub fn into_order(self) -> Order {
        match self {
            PlaceOutcome::Created(order) | PlaceOutcome::Existing(order) => order,
        }
    }

    /// Returns true if this call created the order.
    pub fn is_created(&self) -> bool {
        matches!(self, PlaceOutcome::Created(_))
    }
}

/// Result of a cancellation.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelOutcome {
    pub order: Order,
    /// Set when the order had already been cancelled by an earlier call.
    pub already_cancelled: bool,
}

/// How the pre-freeze step handled a checkout event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeOutcome {
    /// Stock frozen and item snapshot written.
    Frozen,
    /// The freeze failed and the checkout was rolled back.
    Compensated,
    /// The preorder is gone or already resolved.
    Skipped,
}

/// How a delayed task was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The target was still unresolved and has been cancelled or expired.
    Acted,
    /// The target was already resolved.
    NoOp,
}

/// What one expiry sweep resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Unplaced preorders cancelled.
    pub preorders: usize,
    /// Unpaid orders cancelled.
    pub orders: usize,
    /// Targets that failed and are left for the next sweep.
    pub failed: usize,
}

/// Filter for listing a user's orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderQuery {
    pub user_id: UserId,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default = "OrderQuery::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl OrderQuery {
    /// Lists a user's orders, newest first.
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            status: None,
            limit: Self::default_limit(),
            offset: 0,
        }
    }

    /// Restricts the listing to one status.
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the page.
    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    fn default_limit() -> i64 {
        20
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn preorder() -> Preorder {
        let now = Utc::now();
        Preorder {
            id: PreorderId::new(1),
            user_id: UserId::new(2),
            product_id: ProductId::new(3),
            merchant_id: None,
            quantity: 2,
            unit_price: Money::from_cents(750),
            coupon_id: None,
            original: Money::from_cents(1_500),
            discount: Money::zero(),
            payable: Money::from_cents(1_500),
            status: PreorderStatus::Pending,
            snapshot: serde_json::json!({"title": "lamp"}),
            cancel_reason: None,
            expire_at: now + Duration::minutes(15),
            created_at: now,
        }
    }

    #[test]
    fn test_checkout_event_carries_unit_price() {
        let event = CheckoutEvent::from(&preorder());
        assert_eq!(event.price_cents, 750);
        assert_eq!(event.quantity, 2);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["preorder_id"], 1);
        assert_eq!(json["snapshot"]["title"], "lamp");
    }

    #[test]
    fn test_order_copies_preorder_amounts() {
        let p = preorder();
        let order = Order::from_preorder(OrderId::new(100), &p, p.expire_at, p.created_at);
        assert_eq!(order.status, OrderStatus::PendingPayment);
        assert_eq!(order.payable, p.payable);
        assert_eq!(order.preorder_id, p.id);
    }

    #[test]
    fn test_preorder_expiry_is_inclusive() {
        let p = preorder();
        assert!(!p.is_expired(p.created_at));
        assert!(p.is_expired(p.expire_at));
    }

    #[test]
    fn test_order_query_defaults() {
        let q: OrderQuery = serde_json::from_str(r#"{"user_id": 4}"#).unwrap();
        assert_eq!(q.limit, 20);
        assert_eq!(q.offset, 0);
        assert_eq!(q.status, None);
        let q = OrderQuery::for_user(UserId::new(4)).with_status(OrderStatus::Paid).page(5, 10);
        assert_eq!(q.status, Some(OrderStatus::Paid));
        assert_eq!((q.limit, q.offset), (5, 10));
    }
}
