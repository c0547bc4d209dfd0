//! Two-phase ("half message") publishing.
//!
//! A message is first *prepared*: written to the [`OutboxStore`] but
//! invisible to consumers. The caller then commits its local write and asks
//! the publisher to *commit* the message. Before delivering, the publisher
//! calls back a [`PreparedCheck`] to confirm the local write actually landed.
//! If the caller crashes between its write and the commit, or the bus refuses
//! the message, the periodic [`recover`] sweep finds the orphaned half
//! message, runs the same check and delivers it. Half messages whose local
//! write never shows up are discarded after an abandonment window.
//!
//! [`recover`]: TransactionalPublisher::recover

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Clock;
use uuid::Uuid;

use crate::bus::{BusMessage, EventBus};
use crate::error::{Result, SagaError};
use crate::outbox::{HalfMessage, OutboxStore};

/// Confirms that the local write paired with a half message is durable.
#[async_trait]
pub trait PreparedCheck: Send + Sync {
    /// Returns true once the message's local write is visible.
    async fn is_prepared(&self, message: &BusMessage) -> Result<bool>;
}

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Callback attempts during a commit before leaving the message to recovery.
    pub check_attempts: u32,
    /// Base delay between callback attempts; grows linearly.
    pub check_backoff: Duration,
    /// Age after which an uncommitted half message is considered orphaned.
    pub orphan_after: chrono::Duration,
    /// Age after which an orphan that is still not prepared is discarded.
    pub abandon_after: chrono::Duration,
    /// Orphans examined per recovery sweep.
    pub recovery_batch: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            check_attempts: 3,
            check_backoff: Duration::from_millis(50),
            orphan_after: chrono::Duration::seconds(5),
            abandon_after: chrono::Duration::minutes(5),
            recovery_batch: 100,
        }
    }
}

/// Result of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The message was handed to the bus.
    Delivered,
    /// The message stays in the outbox; recovery will retry.
    Pending,
}

/// Result of a recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub delivered: usize,
    pub abandoned: usize,
    pub pending: usize,
}

/// Publisher coupling a local write with a bus message.
pub struct TransactionalPublisher {
    bus: Arc<dyn EventBus>,
    outbox: Arc<dyn OutboxStore>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
}

impl TransactionalPublisher {
    /// Creates a publisher holding half messages in `outbox` and delivering to `bus`.
    pub fn new(
        bus: Arc<dyn EventBus>,
        outbox: Arc<dyn OutboxStore>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            bus,
            outbox,
            clock,
            config,
        }
    }

    /// Holds a message until it is committed or rolled back.
    pub async fn prepare(&self, message: BusMessage) -> Result<Uuid> {
        let id = message.id;
        let half = HalfMessage {
            message,
            prepared_at: self.clock.now(),
        };
        self.outbox.hold(&half).await?;
        tracing::debug!(%id, "Half message prepared");
        Ok(id)
    }

    /// Delivers a prepared message once `check` confirms its local write.
    ///
    /// A message the bus refuses stays in the outbox and is reported as
    /// pending; only a failure to read the outbox is an error.
    #[tracing::instrument(skip(self, check))]
    pub async fn commit(&self, id: Uuid, check: &dyn PreparedCheck) -> Result<CommitOutcome> {
        let message = self
            .outbox
            .get(id)
            .await?
            .map(|h| h.message)
            .ok_or_else(|| SagaError::Messaging(format!("no half message {id}")))?;

        for attempt in 1..=self.config.check_attempts {
            match check.is_prepared(&message).await {
                Ok(true) => return self.deliver(id, message).await,
                Ok(false) => {
                    tracing::debug!(%id, attempt, "Local write not visible yet");
                }
                Err(e) => {
                    tracing::warn!(%id, attempt, error = %e, "Prepared check failed");
                }
            }
            if attempt < self.config.check_attempts {
                tokio::time::sleep(self.config.check_backoff * attempt).await;
            }
        }

        tracing::warn!(%id, "Half message left for recovery");
        Ok(CommitOutcome::Pending)
    }

    /// Discards a prepared message. Returns false if it was not held.
    pub async fn rollback(&self, id: Uuid) -> Result<bool> {
        let removed = self.outbox.remove(id).await?;
        if removed {
            tracing::debug!(%id, "Half message rolled back");
        }
        Ok(removed)
    }

    /// Re-checks orphaned half messages, delivering or discarding them.
    #[tracing::instrument(skip(self, check))]
    pub async fn recover(&self, check: &dyn PreparedCheck) -> Result<RecoveryReport> {
        let now = self.clock.now();
        let orphans = self
            .outbox
            .prepared_before(now - self.config.orphan_after, self.config.recovery_batch)
            .await?;

        let mut report = RecoveryReport::default();
        for HalfMessage {
            message,
            prepared_at,
        } in orphans
        {
            let id = message.id;
            match check.is_prepared(&message).await {
                Ok(true) => match self.deliver(id, message).await? {
                    CommitOutcome::Delivered => report.delivered += 1,
                    CommitOutcome::Pending => report.pending += 1,
                },
                Ok(false) if now - prepared_at >= self.config.abandon_after => {
                    self.outbox.remove(id).await?;
                    tracing::warn!(%id, key = %message.key, "Abandoned half message without local write");
                    report.abandoned += 1;
                }
                Ok(false) => report.pending += 1,
                Err(e) => {
                    tracing::warn!(%id, error = %e, "Prepared check failed during recovery");
                    report.pending += 1;
                }
            }
        }

        if report.delivered > 0 || report.abandoned > 0 {
            tracing::info!(
                delivered = report.delivered,
                abandoned = report.abandoned,
                pending = report.pending,
                "Recovered half messages"
            );
        }
        Ok(report)
    }

    /// Returns the number of half messages held.
    pub async fn pending_count(&self) -> Result<usize> {
        self.outbox.count().await
    }

    async fn deliver(&self, id: Uuid, message: BusMessage) -> Result<CommitOutcome> {
        if let Err(e) = self.bus.publish(message).await {
            tracing::warn!(%id, error = %e, "Publish failed, message stays in outbox");
            self.outbox.record_attempt(id).await?;
            metrics::counter!("saga_publish_failures_total").increment(1);
            return Ok(CommitOutcome::Pending);
        }
        if let Err(e) = self.outbox.remove(id).await {
            // Delivered anyway; a later sweep redelivers and the consumer dedupes.
            tracing::warn!(%id, error = %e, "Delivered message could not be cleared from outbox");
        }
        metrics::counter!("saga_messages_delivered_total").increment(1);
        Ok(CommitOutcome::Delivered)
    }
}
