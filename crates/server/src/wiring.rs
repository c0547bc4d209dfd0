//! Backend selection and service construction.

use std::sync::Arc;

use common::{Clock, SystemClock};
use coupon::{CouponService, CouponStore, InMemoryCouponStore, PostgresCouponStore};
use inventory::{
    AdmissionStore, InMemoryAdmissionStore, InMemoryStockLedger, InventoryService,
    PostgresStockLedger, RedisAdmissionStore, StockLedger,
};
use saga::{
    BusReceiver, CheckoutConsumer, DelayQueue, DelayWorker, EventBus, ExpirySweeper,
    InMemoryDelayQueue, InMemoryEventBus, InMemoryOrderRepository, InMemoryOutbox,
    OrderPlacementSaga, OrderRepository, OutboxRecovery, OutboxStore, PostgresDelayQueue,
    PostgresOrderRepository, PostgresOutbox, PublisherConfig, TransactionalPublisher,
};
use serde::Serialize;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ServerError;

/// Deliveries of a checkout event before it is dead-lettered.
const CHECKOUT_MAX_ATTEMPTS: u32 = 5;

/// Which backend serves each store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Backends {
    pub store: &'static str,
    pub admission: &'static str,
}

/// The wired services and the handles the background workers need.
pub struct Services {
    pub inventory: Arc<InventoryService>,
    pub coupons: Arc<CouponService>,
    pub saga: Arc<OrderPlacementSaga>,
    pub publisher: Arc<TransactionalPublisher>,
    pub delays: Arc<dyn DelayQueue>,
    pub bus: Arc<dyn EventBus>,
    pub receiver: BusReceiver,
    pub backends: Backends,
}

/// Builds the services on the backends `config` selects.
///
/// `DATABASE_URL` switches the ledger, coupon and order stores, the outbox
/// and the delay queue to Postgres, and `REDIS_URL` the admission store to
/// Redis; anything unset runs in memory. The event bus is always in memory.
/// Messages stay in the outbox until published, and the expiry sweep
/// resolves checkouts whose event was lost with the process.
pub async fn build_services(config: &Config) -> Result<Services, ServerError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (ledger, coupon_store, repo, pool, store): (
        Arc<dyn StockLedger>,
        Arc<dyn CouponStore>,
        Arc<dyn OrderRepository>,
        Option<PgPool>,
        &'static str,
    ) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await?;
            let ledger = PostgresStockLedger::new(pool.clone());
            ledger.run_migrations().await?;
            tracing::info!("Connected to Postgres, migrations applied");
            (
                Arc::new(ledger),
                Arc::new(PostgresCouponStore::new(pool.clone())),
                Arc::new(PostgresOrderRepository::new(pool.clone())),
                Some(pool),
                "postgres",
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores");
            (
                Arc::new(InMemoryStockLedger::new()),
                Arc::new(InMemoryCouponStore::new()),
                Arc::new(InMemoryOrderRepository::new()),
                None,
                "memory",
            )
        }
    };

    let (admission_store, admission): (Arc<dyn AdmissionStore>, &'static str) =
        match &config.redis_url {
            Some(url) => {
                let store = RedisAdmissionStore::connect(url).await?;
                tracing::info!("Connected to Redis admission store");
                (Arc::new(store), "redis")
            }
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory admission store");
                (
                    Arc::new(InMemoryAdmissionStore::new(Arc::clone(&clock))),
                    "memory",
                )
            }
        };

    let inventory = Arc::new(InventoryService::new(
        ledger,
        admission_store,
        Arc::clone(&clock),
        config.ticket_ttl,
    ));
    let coupons = Arc::new(CouponService::new(coupon_store, Arc::clone(&clock)));

    let (bus, receiver) = InMemoryEventBus::channel();
    let bus: Arc<dyn EventBus> = Arc::new(bus);
    let (outbox, delays): (Arc<dyn OutboxStore>, Arc<dyn DelayQueue>) = match pool {
        Some(pool) => (
            Arc::new(PostgresOutbox::new(pool.clone())),
            Arc::new(PostgresDelayQueue::new(pool)),
        ),
        None => (
            Arc::new(InMemoryOutbox::new()),
            Arc::new(InMemoryDelayQueue::new()),
        ),
    };
    let publisher = Arc::new(TransactionalPublisher::new(
        Arc::clone(&bus),
        outbox,
        Arc::clone(&clock),
        PublisherConfig::default(),
    ));

    let saga = Arc::new(OrderPlacementSaga::new(
        repo,
        Arc::clone(&inventory),
        Arc::clone(&coupons),
        Arc::clone(&publisher),
        Arc::clone(&delays),
        clock,
        config.saga(),
    ));

    Ok(Services {
        inventory,
        coupons,
        saga,
        publisher,
        delays,
        bus,
        receiver,
        backends: Backends { store, admission },
    })
}

/// Starts the checkout consumer, the delay worker, the outbox sweep and the
/// expiry sweep.
///
/// Every task exits once `shutdown` flips to `true`.
pub fn spawn_workers(
    config: &Config,
    saga: &Arc<OrderPlacementSaga>,
    bus: Arc<dyn EventBus>,
    receiver: BusReceiver,
    delays: Arc<dyn DelayQueue>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let consumer = CheckoutConsumer::new(Arc::clone(saga), bus, CHECKOUT_MAX_ATTEMPTS);
    let delay_worker = DelayWorker::new(Arc::clone(saga), delays, config.delay_poll);
    let recovery = OutboxRecovery::new(Arc::clone(saga), config.outbox_recovery);
    let sweeper = ExpirySweeper::new(Arc::clone(saga), config.expiry_sweep);

    vec![
        tokio::spawn(consumer.run(receiver, shutdown.clone())),
        tokio::spawn(delay_worker.run(shutdown.clone())),
        tokio::spawn(recovery.run(shutdown.clone())),
        tokio::spawn(sweeper.run(shutdown.clone())),
    ]
}
