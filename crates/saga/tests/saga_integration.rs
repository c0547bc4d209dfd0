//! End-to-end saga scenarios over the in-memory backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    Clock, CouponId, ManualClock, MerchantId, Money, OrderId, PaymentId, PreorderId, ProductId,
    UserId,
};
use coupon::{CouponService, CouponStatus, DiscountRule, InMemoryCouponStore, NewTemplate};
use futures_util::future::join_all;
use inventory::{
    AdmissionStore, InMemoryAdmissionStore, InMemoryStockLedger, InventoryError, InventoryService,
    SnapshotState, StockRecord,
};
use saga::{
    BusMessage, BusReceiver, CHECKOUT_TOPIC, CheckoutConsumer, CheckoutEvent, CheckoutRequest,
    DelayQueue, DelayWorker, Delivery, ExpiryReport, FreezeOutcome, InMemoryDelayQueue,
    InMemoryEventBus, InMemoryOrderRepository, InMemoryOutbox, Order, OrderItem,
    OrderPlacementSaga, OrderQuery, OrderRepository, OrderStatus, Payment, PaymentStatus,
    PlaceOutcome, Preorder, PreorderItem, PreorderStatus, PublisherConfig, SagaConfig, SagaError,
    TransactionalPublisher,
};

const SKU: ProductId = ProductId::new(700);
const USER: UserId = UserId::new(42);
const MERCHANT: MerchantId = MerchantId::new(9);

struct Harness {
    saga: Arc<OrderPlacementSaga>,
    inventory: Arc<InventoryService>,
    coupons: Arc<CouponService>,
    admission: InMemoryAdmissionStore,
    repo: Arc<dyn OrderRepository>,
    publisher: Arc<TransactionalPublisher>,
    outbox: InMemoryOutbox,
    delays: Arc<InMemoryDelayQueue>,
    bus: InMemoryEventBus,
    receiver: BusReceiver,
    clock: ManualClock,
}

/// A saga process wired over shared stores.
struct Process {
    saga: Arc<OrderPlacementSaga>,
    publisher: Arc<TransactionalPublisher>,
    bus: InMemoryEventBus,
    receiver: BusReceiver,
}

fn start_process(
    repo: &Arc<dyn OrderRepository>,
    inventory: &Arc<InventoryService>,
    coupons: &Arc<CouponService>,
    outbox: &InMemoryOutbox,
    delays: &Arc<InMemoryDelayQueue>,
    clock: &ManualClock,
) -> Process {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let (bus, receiver) = InMemoryEventBus::channel();
    let publisher = Arc::new(TransactionalPublisher::new(
        Arc::new(bus.clone()),
        Arc::new(outbox.clone()),
        Arc::clone(&shared),
        PublisherConfig {
            check_backoff: StdDuration::from_millis(1),
            ..PublisherConfig::default()
        },
    ));
    let saga = Arc::new(OrderPlacementSaga::new(
        Arc::clone(repo),
        Arc::clone(inventory),
        Arc::clone(coupons),
        Arc::clone(&publisher),
        delays.clone(),
        shared,
        SagaConfig::default(),
    ));
    Process {
        saga,
        publisher,
        bus,
        receiver,
    }
}

impl Harness {
    async fn new(stock: i64) -> Self {
        Self::with_repository(stock, Arc::new(InMemoryOrderRepository::new())).await
    }

    async fn with_repository(stock: i64, repo: Arc<dyn OrderRepository>) -> Self {
        let clock = ManualClock::starting_now();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let admission = InMemoryAdmissionStore::new(Arc::clone(&shared));
        let inventory = Arc::new(InventoryService::new(
            Arc::new(InMemoryStockLedger::new()),
            Arc::new(admission.clone()),
            Arc::clone(&shared),
            StdDuration::from_secs(7200),
        ));
        inventory.create_inventory(SKU, stock).await.unwrap();

        let coupons = Arc::new(CouponService::new(
            Arc::new(InMemoryCouponStore::new()),
            Arc::clone(&shared),
        ));

        let outbox = InMemoryOutbox::new();
        let delays = Arc::new(InMemoryDelayQueue::new());
        let process = start_process(&repo, &inventory, &coupons, &outbox, &delays, &clock);

        Self {
            saga: process.saga,
            inventory,
            coupons,
            admission,
            repo,
            publisher: process.publisher,
            outbox,
            delays,
            bus: process.bus,
            receiver: process.receiver,
            clock,
        }
    }

    /// Replaces the saga with a fresh process over the same durable stores.
    /// Messages in flight on the old bus are lost.
    fn restart(&mut self) {
        let process = start_process(
            &self.repo,
            &self.inventory,
            &self.coupons,
            &self.outbox,
            &self.delays,
            &self.clock,
        );
        self.saga = process.saga;
        self.publisher = process.publisher;
        self.bus = process.bus;
        self.receiver = process.receiver;
    }

    /// Restarts with an empty outbox and delay queue, as a deployment
    /// keeping them in memory would.
    fn restart_losing_queues(&mut self) {
        self.outbox = InMemoryOutbox::new();
        self.delays = Arc::new(InMemoryDelayQueue::new());
        self.restart();
    }

    fn consumer(&self) -> CheckoutConsumer {
        CheckoutConsumer::new(Arc::clone(&self.saga), Arc::new(self.bus.clone()), 3)
    }

    fn delay_worker(&self) -> DelayWorker {
        DelayWorker::new(
            Arc::clone(&self.saga),
            self.delays.clone(),
            StdDuration::from_millis(10),
        )
    }

    /// Delivers every queued checkout event to the consumer.
    async fn drain(&mut self) -> Vec<Delivery> {
        let consumer = self.consumer();
        let mut deliveries = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            deliveries.push(consumer.handle(message).await);
        }
        deliveries
    }

    async fn stock(&self) -> StockRecord {
        self.inventory.get_inventory(SKU).await.unwrap()
    }

    async fn issued(&self) -> i64 {
        match self.admission.snapshot(SKU).await.unwrap() {
            SnapshotState::Live(snapshot) => snapshot.issued,
            other => panic!("expected live epoch, got {other:?}"),
        }
    }

    /// Checks out, freezes and places one order.
    async fn placed_order(&mut self, preorder: i64, quantity: i64) -> Order {
        self.saga
            .checkout(request(preorder, quantity))
            .await
            .unwrap();
        assert_eq!(self.drain().await, vec![Delivery::Handled]);
        self.saga
            .place_order(PreorderId::new(preorder))
            .await
            .unwrap()
    }

    async fn claimed_coupon(&self) -> CouponId {
        let now = self.clock.now();
        let template = self
            .coupons
            .publish_coupon(NewTemplate {
                merchant_id: Some(MERCHANT),
                name: "launch".into(),
                rule: DiscountRule::FixedAmount {
                    amount_off: Money::from_cents(500),
                },
                min_spend: Money::from_cents(1_000),
                total_quantity: 10,
                per_user_limit: 1,
                valid_from: now - Duration::hours(1),
                valid_until: now + Duration::days(3),
            })
            .await
            .unwrap();
        self.coupons
            .claim_coupon(template.id, USER)
            .await
            .unwrap()
            .id
    }

    async fn coupon_status(&self, coupon_id: CouponId) -> CouponStatus {
        self.coupons
            .list_user_coupons(USER)
            .await
            .unwrap()
            .into_iter()
            .find(|view| view.coupon.id == coupon_id)
            .unwrap()
            .effective_status
    }
}

fn request(preorder: i64, quantity: i64) -> CheckoutRequest {
    CheckoutRequest {
        preorder_id: Some(PreorderId::new(preorder)),
        user_id: USER,
        product_id: SKU,
        merchant_id: Some(MERCHANT),
        quantity,
        unit_price: Money::from_cents(1_000),
        coupon_id: None,
        snapshot: serde_json::json!({ "title": "Desk lamp" }),
    }
}

#[tokio::test]
async fn test_checkout_freeze_place_cancel_restores_everything() {
    let mut h = Harness::new(5).await;

    let receipt = h.saga.checkout(request(1, 3)).await.unwrap();
    assert!(!receipt.duplicate);
    assert_eq!(receipt.payable, Money::from_cents(3_000));
    assert_eq!(h.issued().await, 3);

    assert_eq!(h.drain().await, vec![Delivery::Handled]);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (2, 3));

    let order = h.saga.place_order(PreorderId::new(1)).await.unwrap();
    assert_eq!(order.status, OrderStatus::PendingPayment);
    assert_eq!(order.payable, Money::from_cents(3_000));
    let items = h.saga.get_order_items(order.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 3);

    let cancelled = h.saga.cancel_order(order.id, "changed my mind").await.unwrap();
    assert!(!cancelled.already_cancelled);
    assert_eq!(cancelled.order.status, OrderStatus::Cancelled);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock, record.sold), (5, 0, 0));
    assert_eq!(h.issued().await, 0);
    let preorder = h.saga.get_preorder(PreorderId::new(1)).await.unwrap();
    assert_eq!(preorder.status, PreorderStatus::Cancelled);

    let again = h.saga.cancel_order(order.id, "changed my mind").await.unwrap();
    assert!(again.already_cancelled);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (5, 0));
    assert_eq!(h.issued().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_place_order_creates_one_order() {
    let mut h = Harness::new(5).await;
    h.saga.checkout(request(1, 1)).await.unwrap();
    h.drain().await;

    let attempts = (0..8).map(|_| {
        let saga = Arc::clone(&h.saga);
        tokio::spawn(async move { saga.place_order(PreorderId::new(1)).await })
    });
    let orders: Vec<Order> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(orders.iter().all(|o| o.id == orders[0].id));
    let listed = h.saga.list_orders(OrderQuery::for_user(USER)).await.unwrap();
    assert_eq!(listed.len(), 1);
    let preorder = h.saga.get_preorder(PreorderId::new(1)).await.unwrap();
    assert_eq!(preorder.status, PreorderStatus::Placed);
}

#[tokio::test]
async fn test_place_order_before_freeze_is_not_ready() {
    let h = Harness::new(5).await;
    h.saga.checkout(request(1, 1)).await.unwrap();

    let result = h.saga.place_order(PreorderId::new(1)).await;
    assert!(matches!(result, Err(SagaError::PreorderNotReady(_))));
}

#[tokio::test]
async fn test_place_order_after_expiry_is_rejected() {
    let mut h = Harness::new(5).await;
    h.saga.checkout(request(1, 1)).await.unwrap();
    h.drain().await;

    h.clock.advance(Duration::seconds(901));
    let result = h.saga.place_order(PreorderId::new(1)).await;
    assert!(matches!(result, Err(SagaError::PreorderExpired(_))));
}

#[tokio::test]
async fn test_failed_freeze_compensates_checkout() {
    let mut h = Harness::new(5).await;
    h.saga.checkout(request(1, 3)).await.unwrap();

    // Another reservation takes the stock the ticket was issued against.
    h.inventory
        .decrease_pre_inventory(PreorderId::new(99), SKU, 4)
        .await
        .unwrap();

    let consumer = h.consumer();
    let message = h.receiver.try_recv().unwrap();
    let event: CheckoutEvent = message.decode().unwrap();
    assert_eq!(
        h.saga.handle_checkout_event(event).await.unwrap(),
        FreezeOutcome::Compensated
    );
    assert_eq!(consumer.handle(message).await, Delivery::Handled);

    assert!(h.repo.preorder(PreorderId::new(1)).await.unwrap().is_none());
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (1, 4));
    assert_eq!(h.issued().await, 0);

    // The reservation key is burnt; reusing it cannot freeze again.
    h.saga.checkout(request(1, 1)).await.unwrap();
    assert_eq!(h.drain().await, vec![Delivery::Handled]);
    assert!(h.repo.preorder(PreorderId::new(1)).await.unwrap().is_none());
    assert_eq!(h.stock().await.stock, 1);
}

#[tokio::test]
async fn test_checkout_with_coupon_then_payment_sells_stock() {
    let mut h = Harness::new(5).await;
    let coupon_id = h.claimed_coupon().await;

    let receipt = h
        .saga
        .checkout(CheckoutRequest {
            coupon_id: Some(coupon_id),
            ..request(1, 2)
        })
        .await
        .unwrap();
    assert_eq!(receipt.original, Money::from_cents(2_000));
    assert_eq!(receipt.discount, Money::from_cents(500));
    assert_eq!(receipt.payable, Money::from_cents(1_500));
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Locked);

    h.drain().await;
    let order = h.saga.place_order(PreorderId::new(1)).await.unwrap();

    let payment = h.saga.create_payment(order.id).await.unwrap();
    assert_eq!(payment.amount, Money::from_cents(1_500));
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Paying
    );
    let same = h.saga.create_payment(order.id).await.unwrap();
    assert_eq!(same.id, payment.id);

    let paid = h.saga.confirm_payment(payment.id).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert!(paid.paid_at.is_some());
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock, record.sold), (3, 0, 2));
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Used);
    assert!(matches!(
        h.inventory.check_token(PreorderId::new(1), false).await,
        Err(InventoryError::TicketNotFound(_))
    ));

    // Confirming again only re-runs the settled follow-ups.
    h.saga.confirm_payment(payment.id).await.unwrap();
    assert_eq!(h.stock().await.sold, 2);

    assert!(matches!(
        h.saga.cancel_order(order.id, "too late").await,
        Err(SagaError::OrderStatusInvalid { .. })
    ));
    let completed = h.saga.complete_order(order.id).await.unwrap();
    assert_eq!(completed.status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_failed_payment_cancels_order_and_releases_coupon() {
    let mut h = Harness::new(5).await;
    let coupon_id = h.claimed_coupon().await;
    h.saga
        .checkout(CheckoutRequest {
            coupon_id: Some(coupon_id),
            ..request(1, 2)
        })
        .await
        .unwrap();
    h.drain().await;
    let order = h.saga.place_order(PreorderId::new(1)).await.unwrap();
    let payment = h.saga.create_payment(order.id).await.unwrap();

    let outcome = h.saga.fail_payment(payment.id, "card declined").await.unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Cancelled);
    assert_eq!(
        h.saga.get_payment(payment.id).await.unwrap().status,
        PaymentStatus::Failed
    );
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Unused);
    assert_eq!(h.stock().await.stock, 5);
    assert!(matches!(
        h.saga.confirm_payment(payment.id).await,
        Err(SagaError::PaymentStatusInvalid { .. })
    ));
}

#[tokio::test]
async fn test_coupon_checkout_requires_merchant() {
    let h = Harness::new(5).await;
    let coupon_id = h.claimed_coupon().await;

    let result = h
        .saga
        .checkout(CheckoutRequest {
            coupon_id: Some(coupon_id),
            merchant_id: None,
            ..request(1, 2)
        })
        .await;
    assert!(matches!(result, Err(SagaError::InvalidRequest(_))));
    assert_eq!(h.issued().await, 0);
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Unused);
    assert_eq!(h.publisher.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unpaid_order_is_cancelled_by_timer() {
    let mut h = Harness::new(5).await;
    let order = h.placed_order(1, 2).await;
    let worker = h.delay_worker();

    // Preorder expiry fires first and finds the preorder placed.
    h.clock.advance(Duration::seconds(901));
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::PendingPayment
    );

    h.clock.advance(Duration::seconds(900));
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (5, 0));
    assert_eq!(h.delays.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_timers_are_noops_after_payment() {
    let mut h = Harness::new(5).await;
    let order = h.placed_order(1, 1).await;
    let payment = h.saga.create_payment(order.id).await.unwrap();
    h.saga.confirm_payment(payment.id).await.unwrap();

    h.clock.advance(Duration::hours(1));
    let worker = h.delay_worker();
    assert_eq!(worker.tick().await.unwrap(), 3);

    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Paid
    );
    assert_eq!(
        h.saga.get_payment(payment.id).await.unwrap().status,
        PaymentStatus::Succeeded
    );
    assert_eq!(h.stock().await.sold, 1);
}

#[tokio::test]
async fn test_payment_expiry_cancels_order() {
    let mut h = Harness::new(5).await;
    let order = h.placed_order(1, 1).await;
    let payment = h.saga.create_payment(order.id).await.unwrap();

    h.clock.advance(Duration::seconds(601));
    h.delay_worker().tick().await.unwrap();

    assert_eq!(
        h.saga.get_payment(payment.id).await.unwrap().status,
        PaymentStatus::Expired
    );
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(h.stock().await.stock, 5);
}

#[tokio::test]
async fn test_unplaced_preorder_expires() {
    let mut h = Harness::new(5).await;
    h.saga.checkout(request(1, 2)).await.unwrap();
    h.drain().await;

    h.clock.advance(Duration::seconds(901));
    h.delay_worker().tick().await.unwrap();

    let preorder = h.saga.get_preorder(PreorderId::new(1)).await.unwrap();
    assert_eq!(preorder.status, PreorderStatus::Cancelled);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (5, 0));
    assert_eq!(h.issued().await, 0);
}

#[tokio::test]
async fn test_duplicate_checkout_returns_original_receipt() {
    let mut h = Harness::new(5).await;
    let first = h.saga.checkout(request(1, 2)).await.unwrap();
    let second = h.saga.checkout(request(1, 2)).await.unwrap();

    assert!(second.duplicate);
    assert_eq!(second.preorder_id, first.preorder_id);
    assert_eq!(second.expire_at, first.expire_at);
    assert_eq!(h.issued().await, 2);
    assert_eq!(h.drain().await.len(), 1);

    let other_user = CheckoutRequest {
        user_id: UserId::new(7),
        ..request(1, 2)
    };
    assert!(matches!(
        h.saga.checkout(other_user).await,
        Err(SagaError::DuplicateRequest(_))
    ));
}

#[tokio::test]
async fn test_checkout_rejected_when_sold_out() {
    let h = Harness::new(2).await;
    h.saga.checkout(request(1, 2)).await.unwrap();

    let result = h.saga.checkout(request(2, 1)).await;
    assert!(matches!(
        result,
        Err(SagaError::Inventory(InventoryError::InsufficientStock { .. }))
    ));
    assert!(h.repo.preorder(PreorderId::new(2)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_orphaned_half_message_is_recovered() {
    let mut h = Harness::new(5).await;
    let now = h.clock.now();
    let preorder = Preorder {
        id: PreorderId::new(1),
        user_id: USER,
        product_id: SKU,
        merchant_id: None,
        quantity: 1,
        unit_price: Money::from_cents(1_000),
        coupon_id: None,
        original: Money::from_cents(1_000),
        discount: Money::zero(),
        payable: Money::from_cents(1_000),
        status: PreorderStatus::Pending,
        snapshot: serde_json::json!({}),
        cancel_reason: None,
        expire_at: now + Duration::minutes(15),
        created_at: now,
    };
    h.inventory
        .try_get_token(preorder.id, &[inventory::AdmissionItem::new(SKU, 1)])
        .await
        .unwrap();

    // Crash between the local write and the commit.
    let message =
        BusMessage::new(CHECKOUT_TOPIC, "1", &CheckoutEvent::from(&preorder)).unwrap();
    h.publisher.prepare(message).await.unwrap();
    assert!(h.repo.insert_preorder(&preorder).await.unwrap());

    // An orphan whose local write never happened.
    let lost = BusMessage::new(
        CHECKOUT_TOPIC,
        "2",
        &CheckoutEvent {
            preorder_id: PreorderId::new(2),
            ..CheckoutEvent::from(&preorder)
        },
    )
    .unwrap();
    h.publisher.prepare(lost).await.unwrap();

    let report = h.saga.recover_outbox().await.unwrap();
    assert_eq!((report.delivered, report.pending), (0, 0));

    h.clock.advance(Duration::seconds(6));
    let report = h.saga.recover_outbox().await.unwrap();
    assert_eq!((report.delivered, report.abandoned, report.pending), (1, 0, 1));

    h.clock.advance(Duration::minutes(5));
    let report = h.saga.recover_outbox().await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert_eq!(h.publisher.pending_count().await.unwrap(), 0);

    assert_eq!(h.drain().await, vec![Delivery::Handled]);
    assert_eq!(h.stock().await.frozen_stock, 1);
}

#[tokio::test]
async fn test_consumer_dead_letters_foreign_messages() {
    let h = Harness::new(5).await;
    let consumer = h.consumer();

    let foreign = BusMessage::new("order.other", "x", &serde_json::json!({})).unwrap();
    assert_eq!(consumer.handle(foreign).await, Delivery::DeadLettered);

    let garbled = BusMessage::new(CHECKOUT_TOPIC, "x", &serde_json::json!({"bad": 1})).unwrap();
    assert_eq!(consumer.handle(garbled).await, Delivery::DeadLettered);
}

#[tokio::test]
async fn test_transient_freeze_failure_is_redelivered() {
    let repo = Arc::new(FlakyRepository::failing_item_inserts(1));
    let mut h = Harness::with_repository(5, repo).await;
    h.saga.checkout(request(1, 2)).await.unwrap();

    assert_eq!(h.drain().await, vec![Delivery::Redelivered, Delivery::Handled]);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (3, 2));
    h.saga.place_order(PreorderId::new(1)).await.unwrap();
}

#[tokio::test]
async fn test_list_orders_validates_page() {
    let h = Harness::new(5).await;
    let result = h
        .saga
        .list_orders(OrderQuery::for_user(USER).page(0, 0))
        .await;
    assert!(matches!(result, Err(SagaError::InvalidRequest(_))));
    assert!(matches!(
        h.saga.get_order(OrderId::new(1)).await,
        Err(SagaError::OrderNotFound(_))
    ));
    assert!(matches!(
        h.saga.get_payment(PaymentId::new(1)).await,
        Err(SagaError::PaymentNotFound(_))
    ));
}

#[tokio::test]
async fn test_checkout_survives_bus_outage_and_restart() {
    let mut h = Harness::new(5).await;
    let coupon_id = h.claimed_coupon().await;
    h.receiver.close();

    let receipt = h
        .saga
        .checkout(CheckoutRequest {
            coupon_id: Some(coupon_id),
            ..request(1, 2)
        })
        .await
        .unwrap();
    assert!(!receipt.duplicate);
    assert_eq!(h.issued().await, 2);
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Locked);
    assert_eq!(h.publisher.pending_count().await.unwrap(), 1);

    h.restart();
    h.clock.advance(Duration::seconds(6));
    let report = h.saga.recover_outbox().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(h.drain().await, vec![Delivery::Handled]);

    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (3, 2));
    h.saga.place_order(PreorderId::new(1)).await.unwrap();
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Locked);
}

#[tokio::test]
async fn test_restart_keeps_scheduled_timers() {
    let mut h = Harness::new(5).await;
    let order = h.placed_order(1, 2).await;

    h.restart();
    h.clock.advance(Duration::seconds(1801));
    assert_eq!(h.delay_worker().tick().await.unwrap(), 2);

    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(h.stock().await.frozen_stock, 0);
    assert_eq!(h.issued().await, 0);
}

#[tokio::test]
async fn test_expiry_sweep_releases_checkout_lost_in_flight() {
    let mut h = Harness::new(5).await;
    let coupon_id = h.claimed_coupon().await;
    h.saga
        .checkout(CheckoutRequest {
            coupon_id: Some(coupon_id),
            ..request(1, 2)
        })
        .await
        .unwrap();

    // The event was published but the process died before consuming it.
    h.restart_losing_queues();
    let report = h.saga.expire_overdue(100).await.unwrap();
    assert_eq!(report, ExpiryReport::default());

    h.clock.advance(Duration::seconds(901));
    let report = h.saga.expire_overdue(100).await.unwrap();
    assert_eq!((report.preorders, report.orders, report.failed), (1, 0, 0));

    let preorder = h.saga.get_preorder(PreorderId::new(1)).await.unwrap();
    assert_eq!(preorder.status, PreorderStatus::Cancelled);
    assert_eq!(h.issued().await, 0);
    assert_eq!(h.coupon_status(coupon_id).await, CouponStatus::Unused);

    let report = h.saga.expire_overdue(100).await.unwrap();
    assert_eq!(report, ExpiryReport::default());
}

#[tokio::test]
async fn test_expiry_sweep_cancels_order_whose_timers_were_lost() {
    let mut h = Harness::new(5).await;
    let order = h.placed_order(1, 1).await;
    let payment = h.saga.create_payment(order.id).await.unwrap();

    h.restart_losing_queues();
    h.clock.advance(Duration::seconds(1801));
    let report = h.saga.expire_overdue(100).await.unwrap();
    assert_eq!((report.preorders, report.orders), (0, 1));

    assert_eq!(
        h.saga.get_payment(payment.id).await.unwrap().status,
        PaymentStatus::Expired
    );
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (5, 0));
}

#[tokio::test]
async fn test_dead_lettered_checkout_is_released_by_expiry_sweep() {
    let repo = Arc::new(FlakyRepository::failing_item_inserts(10));
    let mut h = Harness::with_repository(5, repo).await;
    h.saga.checkout(request(1, 2)).await.unwrap();

    assert_eq!(
        h.drain().await,
        vec![
            Delivery::Redelivered,
            Delivery::Redelivered,
            Delivery::DeadLettered
        ]
    );
    assert_eq!(h.stock().await.frozen_stock, 2);

    h.clock.advance(Duration::seconds(901));
    let report = h.saga.expire_overdue(100).await.unwrap();
    assert_eq!(report.preorders, 1);
    let record = h.stock().await;
    assert_eq!((record.stock, record.frozen_stock), (5, 0));
    assert_eq!(h.issued().await, 0);
}

#[tokio::test]
async fn test_failed_timer_is_retried_until_order_cancelled() {
    let repo = Arc::new(FlakyRepository::failing_order_transitions(0));
    let mut h = Harness::with_repository(5, Arc::clone(&repo) as Arc<dyn OrderRepository>).await;
    let order = h.placed_order(1, 2).await;
    repo.transition_failures.store(1, Ordering::SeqCst);

    let worker = h.delay_worker().with_retry_backoff(Duration::seconds(5));
    h.clock.advance(Duration::seconds(1801));
    assert_eq!(worker.tick().await.unwrap(), 2);
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::PendingPayment
    );
    assert_eq!(h.delays.len().await.unwrap(), 1);
    let retry = &h.delays.scheduled().await[0];
    assert_eq!(retry.attempts, 1);
    assert_eq!(retry.run_at, h.clock.now() + Duration::seconds(5));

    assert_eq!(worker.tick().await.unwrap(), 0);
    h.clock.advance(Duration::seconds(5));
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(
        h.saga.get_order(order.id).await.unwrap().status,
        OrderStatus::Cancelled
    );
    assert_eq!(h.stock().await.frozen_stock, 0);
    assert_eq!(h.delays.len().await.unwrap(), 0);
}

/// Repository whose item inserts or order transitions fail a set number of times.
struct FlakyRepository {
    inner: InMemoryOrderRepository,
    item_failures: AtomicU32,
    transition_failures: AtomicU32,
}

impl FlakyRepository {
    fn failing_item_inserts(times: u32) -> Self {
        Self {
            inner: InMemoryOrderRepository::new(),
            item_failures: AtomicU32::new(times),
            transition_failures: AtomicU32::new(0),
        }
    }

    fn failing_order_transitions(times: u32) -> Self {
        Self {
            inner: InMemoryOrderRepository::new(),
            item_failures: AtomicU32::new(0),
            transition_failures: AtomicU32::new(times),
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl OrderRepository for FlakyRepository {
    async fn insert_preorder(&self, preorder: &Preorder) -> saga::Result<bool> {
        self.inner.insert_preorder(preorder).await
    }

    async fn preorder(&self, preorder_id: PreorderId) -> saga::Result<Option<Preorder>> {
        self.inner.preorder(preorder_id).await
    }

    async fn delete_pending_preorder(&self, preorder_id: PreorderId) -> saga::Result<bool> {
        self.inner.delete_pending_preorder(preorder_id).await
    }

    async fn insert_preorder_item(&self, item: &PreorderItem) -> saga::Result<bool> {
        if take_failure(&self.item_failures) {
            return Err(SagaError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_preorder_item(item).await
    }

    async fn preorder_items(&self, preorder_id: PreorderId) -> saga::Result<Vec<PreorderItem>> {
        self.inner.preorder_items(preorder_id).await
    }

    async fn transition_preorder(
        &self,
        preorder_id: PreorderId,
        from: &[PreorderStatus],
        to: PreorderStatus,
        reason: Option<&str>,
    ) -> saga::Result<bool> {
        self.inner
            .transition_preorder(preorder_id, from, to, reason)
            .await
    }

    async fn place_order(
        &self,
        preorder_id: PreorderId,
        order_id: OrderId,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> saga::Result<PlaceOutcome> {
        self.inner
            .place_order(preorder_id, order_id, expire_time, now)
            .await
    }

    async fn order(&self, order_id: OrderId) -> saga::Result<Option<Order>> {
        self.inner.order(order_id).await
    }

    async fn order_by_preorder(&self, preorder_id: PreorderId) -> saga::Result<Option<Order>> {
        self.inner.order_by_preorder(preorder_id).await
    }

    async fn order_items(&self, order_id: OrderId) -> saga::Result<Vec<OrderItem>> {
        self.inner.order_items(order_id).await
    }

    async fn list_orders(&self, query: &OrderQuery) -> saga::Result<Vec<Order>> {
        self.inner.list_orders(query).await
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> saga::Result<bool> {
        if take_failure(&self.transition_failures) {
            return Err(SagaError::InvalidRequest("order row rejected the update".into()));
        }
        self.inner
            .transition_order(order_id, from, to, reason, now)
            .await
    }

    async fn expired_preorders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> saga::Result<Vec<PreorderId>> {
        self.inner.expired_preorders(now, limit).await
    }

    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> saga::Result<Vec<OrderId>> {
        self.inner.expired_orders(now, limit).await
    }

    async fn insert_payment(&self, payment: &Payment) -> saga::Result<(Payment, bool)> {
        self.inner.insert_payment(payment).await
    }

    async fn payment(&self, payment_id: PaymentId) -> saga::Result<Option<Payment>> {
        self.inner.payment(payment_id).await
    }

    async fn payment_for_order(&self, order_id: OrderId) -> saga::Result<Option<Payment>> {
        self.inner.payment_for_order(order_id).await
    }

    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        from: &[PaymentStatus],
        to: PaymentStatus,
        now: DateTime<Utc>,
    ) -> saga::Result<bool> {
        self.inner
            .transition_payment(payment_id, from, to, now)
            .await
    }
}
