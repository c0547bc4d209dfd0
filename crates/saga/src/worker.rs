//! Background consumers driving the asynchronous saga steps.
//!
//! - [`CheckoutConsumer`] feeds checkout events to the pre-freeze step.
//! - [`DelayWorker`] fires due timers.
//! - [`OutboxRecovery`] sweeps half messages orphaned by a crash.
//! - [`ExpirySweeper`] cancels preorders and orders left open past expiry.
//!
//! Each loop stops when its shutdown channel flips to `true`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::bus::{BusMessage, BusReceiver, CHECKOUT_TOPIC, EventBus};
use crate::coordinator::OrderPlacementSaga;
use crate::delay::{DelayQueue, ScheduledTask};
use crate::error::Result;
use crate::model::CheckoutEvent;

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The handler finished (including handlers that compensated or skipped).
    Handled,
    /// The handler failed transiently and the message was put back on the bus.
    Redelivered,
    /// The message could not be handled and was dropped. The expiry sweep
    /// cleans up its preorder.
    DeadLettered,
}

/// Consumes the checkout topic.
pub struct CheckoutConsumer {
    saga: Arc<OrderPlacementSaga>,
    bus: Arc<dyn EventBus>,
    max_attempts: u32,
}

impl CheckoutConsumer {
    /// Creates a consumer that re-publishes failed messages to `bus` up to
    /// `max_attempts` deliveries.
    pub fn new(saga: Arc<OrderPlacementSaga>, bus: Arc<dyn EventBus>, max_attempts: u32) -> Self {
        Self {
            saga,
            bus,
            max_attempts,
        }
    }

    /// Handles one delivery.
    pub async fn handle(&self, message: BusMessage) -> Delivery {
        if message.topic != CHECKOUT_TOPIC {
            tracing::warn!(topic = %message.topic, "Unexpected topic, dropping message");
            return Delivery::DeadLettered;
        }
        let event: CheckoutEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(id = %message.id, error = %e, "Undecodable checkout event");
                metrics::counter!("saga_dead_letters_total").increment(1);
                return Delivery::DeadLettered;
            }
        };

        let error = match self.saga.handle_checkout_event(event).await {
            Ok(_) => return Delivery::Handled,
            Err(e) => e,
        };

        let key = message.key.clone();
        let attempts = message.attempts + 1;
        if error.is_transient() && attempts < self.max_attempts {
            tracing::warn!(%key, attempts, error = %error, "Checkout event failed, redelivering");
            match self.bus.publish(message.redelivery()).await {
                Ok(()) => return Delivery::Redelivered,
                Err(e) => tracing::error!(%key, error = %e, "Redelivery failed"),
            }
        }
        // The expiry sweep releases whatever the preorder still holds.
        tracing::error!(%key, attempts, error = %error, "Checkout event dead-lettered");
        metrics::counter!("saga_dead_letters_total").increment(1);
        Delivery::DeadLettered
    }

    /// Consumes until the channel closes or shutdown is signalled.
    pub async fn run(self, mut receiver: BusReceiver, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("checkout consumer started");
        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => {
                        self.handle(message).await;
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("checkout consumer stopped");
    }
}

/// Fires due delayed tasks.
pub struct DelayWorker {
    saga: Arc<OrderPlacementSaga>,
    queue: Arc<dyn DelayQueue>,
    poll: Duration,
    batch: usize,
    retry_backoff: chrono::Duration,
    max_attempts: u32,
}

impl DelayWorker {
    /// Creates a worker polling `queue` every `poll`.
    pub fn new(saga: Arc<OrderPlacementSaga>, queue: Arc<dyn DelayQueue>, poll: Duration) -> Self {
        Self {
            saga,
            queue,
            poll,
            batch: 100,
            retry_backoff: chrono::Duration::seconds(5),
            max_attempts: 10,
        }
    }

    /// Sets the linear backoff step for failed tasks.
    pub fn with_retry_backoff(mut self, step: chrono::Duration) -> Self {
        self.retry_backoff = step;
        self
    }

    /// Runs every task due now. Returns how many were taken.
    ///
    /// A task is removed from the queue only once its handler succeeds. A
    /// failed task is rescheduled after `attempts` backoff steps, capped at
    /// `max_attempts` steps; past the cap it keeps retrying at the capped
    /// interval and is counted as a dead letter.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.saga.clock().now();
        let due = self.queue.take_due(now, self.batch).await?;
        let taken = due.len();

        for scheduled in due {
            let ScheduledTask {
                id, task, attempts, ..
            } = scheduled;
            match self.saga.handle_delayed_task(task).await {
                Ok(_) => self.queue.complete(id).await?,
                Err(e) => {
                    let attempts = attempts.saturating_add(1);
                    let steps = attempts.min(self.max_attempts);
                    let run_at = now + self.retry_backoff * steps as i32;
                    if attempts >= self.max_attempts {
                        tracing::error!(kind = task.kind(), attempts, error = %e, "Timer keeps failing");
                        metrics::counter!("saga_dead_letters_total").increment(1);
                    } else {
                        tracing::warn!(kind = task.kind(), attempts, error = %e, "Timer failed, rescheduling");
                    }
                    self.queue
                        .schedule(ScheduledTask {
                            id,
                            task,
                            run_at,
                            attempts,
                        })
                        .await?;
                }
            }
        }
        Ok(taken)
    }

    /// Polls until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(poll_ms = self.poll.as_millis() as u64, "delay worker started");
        let mut interval = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Delay queue poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("delay worker stopped");
    }
}

/// Periodically recovers orphaned half messages.
pub struct OutboxRecovery {
    saga: Arc<OrderPlacementSaga>,
    every: Duration,
}

impl OutboxRecovery {
    /// Creates a sweep running every `every`.
    pub fn new(saga: Arc<OrderPlacementSaga>, every: Duration) -> Self {
        Self { saga, every }
    }

    /// Sweeps until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(every_secs = self.every.as_secs(), "outbox recovery started");
        let mut interval = tokio::time::interval(self.every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.saga.recover_outbox().await {
                        tracing::error!(error = %e, "Outbox recovery failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("outbox recovery stopped");
    }
}

/// Periodically cancels preorders and orders left open past their expiry.
///
/// The first sweep runs immediately, so work orphaned by a previous process
/// is resolved at startup.
pub struct ExpirySweeper {
    saga: Arc<OrderPlacementSaga>,
    every: Duration,
    batch: usize,
}

impl ExpirySweeper {
    /// Creates a sweep running every `every`.
    pub fn new(saga: Arc<OrderPlacementSaga>, every: Duration) -> Self {
        Self {
            saga,
            every,
            batch: 100,
        }
    }

    /// Sweeps until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(every_secs = self.every.as_secs(), "expiry sweeper started");
        let mut interval = tokio::time::interval(self.every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.saga.expire_overdue(self.batch).await {
                        tracing::error!(error = %e, "Expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("expiry sweeper stopped");
    }
}
