use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId, PreorderId, ProductId};
use tokio::sync::RwLock;

use super::{OrderRepository, check_placeable};
use crate::error::{Result, SagaError};
use crate::model::{
    Order, OrderItem, OrderQuery, Payment, PlaceOutcome, Preorder, PreorderItem,
};
use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

#[derive(Default)]
struct Tables {
    preorders: HashMap<PreorderId, Preorder>,
    preorder_items: BTreeMap<(PreorderId, ProductId), PreorderItem>,
    orders: HashMap<OrderId, Order>,
    order_by_preorder: HashMap<PreorderId, OrderId>,
    order_items: BTreeMap<(OrderId, ProductId), OrderItem>,
    payments: HashMap<PaymentId, Payment>,
    payment_by_order: HashMap<OrderId, PaymentId>,
}

impl Tables {
    fn items_of(&self, preorder_id: PreorderId) -> Vec<PreorderItem> {
        self.preorder_items
            .range((preorder_id, ProductId::new(i64::MIN))..=(preorder_id, ProductId::new(i64::MAX)))
            .map(|(_, item)| item.clone())
            .collect()
    }

    fn existing_order(&self, preorder_id: PreorderId) -> Option<Order> {
        self.order_by_preorder
            .get(&preorder_id)
            .and_then(|id| self.orders.get(id))
            .cloned()
    }
}

/// In-memory order repository. Each call runs under one lock.
#[derive(Clone, Default)]
pub struct InMemoryOrderRepository {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryOrderRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert_preorder(&self, preorder: &Preorder) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.preorders.contains_key(&preorder.id) {
            return Ok(false);
        }
        tables.preorders.insert(preorder.id, preorder.clone());
        Ok(true)
    }

    async fn preorder(&self, preorder_id: PreorderId) -> Result<Option<Preorder>> {
        Ok(self.tables.read().await.preorders.get(&preorder_id).cloned())
    }

    async fn delete_pending_preorder(&self, preorder_id: PreorderId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let pending = tables
            .preorders
            .get(&preorder_id)
            .is_some_and(|p| p.status == PreorderStatus::Pending);
        if !pending {
            return Ok(false);
        }
        tables.preorders.remove(&preorder_id);
        tables.preorder_items.retain(|(id, _), _| *id != preorder_id);
        Ok(true)
    }

    async fn insert_preorder_item(&self, item: &PreorderItem) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if !tables.preorders.contains_key(&item.preorder_id) {
            return Err(SagaError::PreorderNotFound(item.preorder_id));
        }
        let key = (item.preorder_id, item.product_id);
        if tables.preorder_items.contains_key(&key) {
            return Ok(false);
        }
        tables.preorder_items.insert(key, item.clone());
        Ok(true)
    }

    async fn preorder_items(&self, preorder_id: PreorderId) -> Result<Vec<PreorderItem>> {
        Ok(self.tables.read().await.items_of(preorder_id))
    }

    async fn transition_preorder(
        &self,
        preorder_id: PreorderId,
        from: &[PreorderStatus],
        to: PreorderStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(preorder) = tables.preorders.get_mut(&preorder_id) else {
            return Ok(false);
        };
        if !from.contains(&preorder.status) {
            return Ok(false);
        }
        preorder.status = to;
        if let Some(reason) = reason {
            preorder.cancel_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn place_order(
        &self,
        preorder_id: PreorderId,
        order_id: OrderId,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PlaceOutcome> {
        let mut tables = self.tables.write().await;
        if let Some(order) = tables.existing_order(preorder_id) {
            return Ok(PlaceOutcome::Existing(order));
        }

        let preorder = tables
            .preorders
            .get(&preorder_id)
            .cloned()
            .ok_or(SagaError::PreorderNotFound(preorder_id))?;
        let items = tables.items_of(preorder_id);
        check_placeable(&preorder, !items.is_empty(), now)?;

        if let Some(p) = tables.preorders.get_mut(&preorder_id) {
            p.status = PreorderStatus::Placed;
        }
        let order = Order::from_preorder(order_id, &preorder, expire_time, now);
        tables.orders.insert(order_id, order.clone());
        tables.order_by_preorder.insert(preorder_id, order_id);
        for item in items {
            tables.order_items.insert(
                (order_id, item.product_id),
                OrderItem {
                    order_id,
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    snapshot: item.snapshot,
                },
            );
        }
        Ok(PlaceOutcome::Created(order))
    }

    async fn order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.orders.get(&order_id).cloned())
    }

    async fn order_by_preorder(&self, preorder_id: PreorderId) -> Result<Option<Order>> {
        Ok(self.tables.read().await.existing_order(preorder_id))
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        Ok(self
            .tables
            .read()
            .await
            .order_items
            .iter()
            .filter(|((id, _), _)| *id == order_id)
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == query.user_id)
            .filter(|o| query.status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(orders
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(order) = tables.orders.get_mut(&order_id) else {
            return Ok(false);
        };
        if !from.contains(&order.status) {
            return Ok(false);
        }
        order.status = to;
        order.updated_at = now;
        if to == OrderStatus::Paid {
            order.paid_at = Some(now);
        }
        if let Some(reason) = reason {
            order.cancel_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(Payment, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .payment_by_order
            .get(&payment.order_id)
            .and_then(|id| tables.payments.get(id))
        {
            return Ok((existing.clone(), false));
        }
        tables.payments.insert(payment.id, payment.clone());
        tables.payment_by_order.insert(payment.order_id, payment.id);
        Ok((payment.clone(), true))
    }

    async fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.tables.read().await.payments.get(&payment_id).cloned())
    }

    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_by_order
            .get(&order_id)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        from: &[PaymentStatus],
        to: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(payment) = tables.payments.get_mut(&payment_id) else {
            return Ok(false);
        };
        if !from.contains(&payment.status) {
            return Ok(false);
        }
        payment.status = to;
        payment.updated_at = now;
        Ok(true)
    }

    async fn expired_preorders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PreorderId>> {
        let tables = self.tables.read().await;
        let mut expired: Vec<&Preorder> = tables
            .preorders
            .values()
            .filter(|p| p.status == PreorderStatus::Pending && p.expire_at <= now)
            .collect();
        expired.sort_by_key(|p| (p.expire_at, p.id));
        Ok(expired.into_iter().take(limit).map(|p| p.id).collect())
    }

    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>> {
        let tables = self.tables.read().await;
        let mut expired: Vec<&Order> = tables
            .orders
            .values()
            .filter(|o| o.status.can_cancel() && o.expire_time <= now)
            .collect();
        expired.sort_by_key(|o| (o.expire_time, o.id));
        Ok(expired.into_iter().take(limit).map(|o| o.id).collect())
    }
}
