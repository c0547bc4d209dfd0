//! Order placement saga coordinator.
//!
//! Orchestrates a purchase from checkout to payment across the inventory and
//! coupon services:
//!
//! ```text
//! checkout ──► pre-freeze ──► place order ──► create payment ──► confirm payment
//!    │             │               │                │
//!    └─────────────┴───────────────┴────────────────┴──► cancel (compensate)
//! ```
//!
//! Every step is keyed by a durable id (preorder, order or payment) and
//! re-derives from stored state whether it still has work to do, so retried,
//! duplicated or reordered deliveries are harmless. Each step that can fail
//! after partially succeeding compensates inline; timers are only the
//! backstop for crashes between steps, and the expiry sweep backs up the
//! timers.

mod cancel;
mod checkout;
mod payment;
mod placement;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, IdGenerator, OrderId, PaymentId, PreorderId};
use coupon::CouponService;
use inventory::InventoryService;

use crate::bus::{BusMessage, CHECKOUT_TOPIC};
use crate::delay::{DelayQueue, DelayedTask, ScheduledTask};
use crate::error::{Result, SagaError};
use crate::model::{CheckoutEvent, Order, OrderItem, OrderQuery, Payment, Preorder};
use crate::repository::OrderRepository;
use crate::transactional::{PreparedCheck, RecoveryReport, TransactionalPublisher};

/// Saga timing and identity settings.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Node component of generated ids.
    pub node_id: u16,
    /// How long a preorder may stay unplaced.
    pub preorder_ttl: chrono::Duration,
    /// How long an order may stay unpaid.
    pub order_ttl: chrono::Duration,
    /// How long a payment may stay unconfirmed.
    pub payment_ttl: chrono::Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            preorder_ttl: chrono::Duration::seconds(900),
            order_ttl: chrono::Duration::seconds(1800),
            payment_ttl: chrono::Duration::seconds(600),
        }
    }
}

/// Coordinates the order placement saga.
pub struct OrderPlacementSaga {
    repo: Arc<dyn OrderRepository>,
    inventory: Arc<InventoryService>,
    coupons: Arc<CouponService>,
    publisher: Arc<TransactionalPublisher>,
    delays: Arc<dyn DelayQueue>,
    ids: IdGenerator,
    clock: Arc<dyn Clock>,
    config: SagaConfig,
}

impl OrderPlacementSaga {
    /// Creates a new saga coordinator.
    pub fn new(
        repo: Arc<dyn OrderRepository>,
        inventory: Arc<InventoryService>,
        coupons: Arc<CouponService>,
        publisher: Arc<TransactionalPublisher>,
        delays: Arc<dyn DelayQueue>,
        clock: Arc<dyn Clock>,
        config: SagaConfig,
    ) -> Self {
        Self {
            repo,
            inventory,
            coupons,
            publisher,
            delays,
            ids: IdGenerator::new(config.node_id, Arc::clone(&clock)),
            clock,
            config,
        }
    }

    /// Returns the order repository.
    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repo
    }

    /// Returns the inventory service.
    pub fn inventory(&self) -> &Arc<InventoryService> {
        &self.inventory
    }

    /// Returns the clock driving expiries.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the coupon service.
    pub fn coupons(&self) -> &Arc<CouponService> {
        &self.coupons
    }

    /// Returns true once the preorder behind a checkout message is durable.
    pub async fn query_prepared(&self, preorder_id: PreorderId) -> Result<bool> {
        Ok(self.repo.preorder(preorder_id).await?.is_some())
    }

    /// Delivers or discards checkout messages orphaned by a crash.
    pub async fn recover_outbox(&self) -> Result<RecoveryReport> {
        self.publisher.recover(self).await
    }

    /// Loads a preorder.
    pub async fn get_preorder(&self, preorder_id: PreorderId) -> Result<Preorder> {
        self.repo
            .preorder(preorder_id)
            .await?
            .ok_or(SagaError::PreorderNotFound(preorder_id))
    }

    /// Loads an order.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Order> {
        self.repo
            .order(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }

    /// Loads the lines of an order.
    pub async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        self.get_order(order_id).await?;
        self.repo.order_items(order_id).await
    }

    /// Lists a user's orders, newest first.
    pub async fn list_orders(&self, query: OrderQuery) -> Result<Vec<Order>> {
        if query.limit <= 0 || query.offset < 0 {
            return Err(SagaError::InvalidRequest(format!(
                "bad page limit={} offset={}",
                query.limit, query.offset
            )));
        }
        self.repo.list_orders(&query).await
    }

    /// Loads a payment.
    pub async fn get_payment(&self, payment_id: PaymentId) -> Result<Payment> {
        self.repo
            .payment(payment_id)
            .await?
            .ok_or(SagaError::PaymentNotFound(payment_id))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn schedule(&self, task: DelayedTask, run_at: DateTime<Utc>) -> Result<()> {
        self.delays.schedule(ScheduledTask::new(task, run_at)).await
    }
}

#[async_trait]
impl PreparedCheck for OrderPlacementSaga {
    async fn is_prepared(&self, message: &BusMessage) -> Result<bool> {
        if message.topic != CHECKOUT_TOPIC {
            return Ok(false);
        }
        let event: CheckoutEvent = message.decode()?;
        self.query_prepared(event.preorder_id).await
    }
}

fn observe(step: &'static str, started: Instant) {
    metrics::histogram!("saga_step_duration_seconds", "step" => step)
        .record(started.elapsed().as_secs_f64());
}
