//! Order placement saga.
//!
//! Drives a purchase across the stock ledger, the admission controller and
//! the coupon lock engine:
//!
//! 1. Checkout admits the preorder, prices it, locks its coupon and
//!    publishes a checkout event through a transactional half message.
//! 2. The checkout consumer pre-freezes stock for the preorder.
//! 3. Placing the order promotes the preorder exactly once.
//! 4. Confirming payment sells the frozen stock and redeems the coupon.
//!
//! Any step that fails compensates the ones before it, and delayed timers
//! cancel whatever is left unpaid. An expiry sweep catches anything whose
//! timer or checkout event was lost.

pub mod bus;
pub mod coordinator;
pub mod delay;
pub mod error;
pub mod model;
pub mod outbox;
pub mod repository;
pub mod state;
pub mod transactional;
pub mod worker;

pub use bus::{BusMessage, BusReceiver, CHECKOUT_TOPIC, EventBus, InMemoryEventBus};
pub use coordinator::{OrderPlacementSaga, SagaConfig};
pub use delay::{DelayQueue, DelayedTask, InMemoryDelayQueue, PostgresDelayQueue, ScheduledTask};
pub use error::{Result, SagaError};
pub use model::{
    CancelOutcome, CheckoutEvent, CheckoutReceipt, CheckoutRequest, ExpiryReport, FreezeOutcome,
    Order, OrderItem, OrderQuery, Payment, PlaceOutcome, Preorder, PreorderItem, TaskOutcome,
};
pub use outbox::{HalfMessage, InMemoryOutbox, OutboxStore, PostgresOutbox};
pub use repository::{InMemoryOrderRepository, OrderRepository, PostgresOrderRepository};
pub use state::{OrderStatus, PaymentStatus, PreorderStatus};
pub use transactional::{
    CommitOutcome, PreparedCheck, PublisherConfig, RecoveryReport, TransactionalPublisher,
};
pub use worker::{CheckoutConsumer, Delivery, DelayWorker, ExpirySweeper, OutboxRecovery};
