use chrono::{DateTime, Utc};
use common::{OrderId, PreorderId};
use inventory::InventoryError;

use super::OrderPlacementSaga;
use crate::delay::DelayedTask;
use crate::error::{Result, SagaError};
use crate::model::{CancelOutcome, ExpiryReport, Preorder, TaskOutcome};
use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

impl OrderPlacementSaga {
    /// Cancels an unpaid order and releases everything its preorder holds.
    ///
    /// The order row is claimed first with a conditional transition that
    /// excludes the paid state, then stock, ticket and coupon are rolled
    /// back. Every rollback is idempotent, so a repeated cancel re-runs them
    /// as no-ops and reports the order as already cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<CancelOutcome> {
        let order = self.get_order(order_id).await?;
        if order.status.is_paid() {
            return Err(SagaError::OrderStatusInvalid {
                order_id,
                status: order.status,
                op: "cancel",
            });
        }

        let claimed = self
            .repo
            .transition_order(
                order_id,
                OrderStatus::CANCELLABLE,
                OrderStatus::Cancelled,
                Some(reason),
                self.now(),
            )
            .await?;
        if !claimed {
            let current = self.get_order(order_id).await?;
            if current.status != OrderStatus::Cancelled {
                return Err(SagaError::OrderStatusInvalid {
                    order_id,
                    status: current.status,
                    op: "cancel",
                });
            }
        }

        let preorder = self.get_preorder(order.preorder_id).await?;
        self.release_resources(&preorder).await?;
        self.repo
            .transition_preorder(
                preorder.id,
                &[PreorderStatus::Pending, PreorderStatus::Placed],
                PreorderStatus::Cancelled,
                Some(reason),
            )
            .await?;

        if claimed {
            metrics::counter!("saga_compensations_total", "step" => "cancel_order").increment(1);
            tracing::info!(%order_id, reason, "Order cancelled");
        } else {
            tracing::debug!(%order_id, "Order already cancelled");
        }
        Ok(CancelOutcome {
            order: self.get_order(order_id).await?,
            already_cancelled: !claimed,
        })
    }

    /// Cancels a preorder that has not been placed.
    ///
    /// A placed preorder is cancelled through its order instead.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_preorder(&self, preorder_id: PreorderId, reason: &str) -> Result<Preorder> {
        let preorder = self.get_preorder(preorder_id).await?;
        let claimed = self
            .repo
            .transition_preorder(
                preorder_id,
                &[PreorderStatus::Pending],
                PreorderStatus::Cancelled,
                Some(reason),
            )
            .await?;
        if !claimed {
            let current = self.get_preorder(preorder_id).await?;
            if current.status != PreorderStatus::Cancelled {
                return Err(SagaError::PreorderStatusInvalid {
                    preorder_id,
                    status: current.status,
                    op: "cancel",
                });
            }
        }

        self.release_resources(&preorder).await?;
        if claimed {
            metrics::counter!("saga_compensations_total", "step" => "cancel_preorder").increment(1);
            tracing::info!(%preorder_id, reason, "Preorder cancelled");
        }
        self.get_preorder(preorder_id).await
    }

    /// Runs a fired timer against current state.
    #[tracing::instrument(skip(self), fields(kind = task.kind()))]
    pub async fn handle_delayed_task(&self, task: DelayedTask) -> Result<TaskOutcome> {
        let outcome = match task {
            DelayedTask::CancelPreorderIfUnpaid { preorder_id } => {
                match self.repo.preorder(preorder_id).await? {
                    Some(p) if p.status == PreorderStatus::Pending => {
                        match self.cancel_preorder(preorder_id, "preorder expired").await {
                            Ok(_) => TaskOutcome::Acted,
                            // Placed between the lookup and the cancel.
                            Err(SagaError::PreorderStatusInvalid { .. }) => TaskOutcome::NoOp,
                            Err(e) => return Err(e),
                        }
                    }
                    _ => TaskOutcome::NoOp,
                }
            }
            DelayedTask::CancelOrderIfUnpaid { order_id } => {
                match self.repo.order(order_id).await? {
                    Some(o) if o.status.can_cancel() => self.cancel_on_timeout(order_id, "order unpaid").await?,
                    _ => TaskOutcome::NoOp,
                }
            }
            DelayedTask::ExpirePayment { payment_id } => {
                match self.repo.payment(payment_id).await? {
                    Some(p) if p.status == PaymentStatus::Pending => {
                        let expired = self
                            .repo
                            .transition_payment(
                                payment_id,
                                &[PaymentStatus::Pending],
                                PaymentStatus::Expired,
                                self.now(),
                            )
                            .await?;
                        if expired {
                            self.cancel_on_timeout(p.order_id, "payment expired").await?;
                            TaskOutcome::Acted
                        } else {
                            TaskOutcome::NoOp
                        }
                    }
                    _ => TaskOutcome::NoOp,
                }
            }
        };

        let label = match outcome {
            TaskOutcome::Acted => "acted",
            TaskOutcome::NoOp => "noop",
        };
        metrics::counter!("saga_timers_fired_total", "kind" => task.kind(), "outcome" => label)
            .increment(1);
        Ok(outcome)
    }

    /// Resolves preorders and orders still open past their expiry.
    ///
    /// Runs the same handlers as the timers, so it only acts on targets a
    /// timer would have acted on. This covers timers lost with a crashed
    /// process and checkout events that were dead-lettered before their
    /// expiry timer was scheduled. Failures are counted and left for the
    /// next sweep.
    #[tracing::instrument(skip(self))]
    pub async fn expire_overdue(&self, limit: usize) -> Result<ExpiryReport> {
        let now = self.now();
        let mut report = ExpiryReport::default();

        for preorder_id in self.repo.expired_preorders(now, limit).await? {
            let task = DelayedTask::CancelPreorderIfUnpaid { preorder_id };
            match self.handle_delayed_task(task).await {
                Ok(TaskOutcome::Acted) => report.preorders += 1,
                Ok(TaskOutcome::NoOp) => {}
                Err(e) => {
                    tracing::warn!(%preorder_id, error = %e, "Overdue preorder not cancelled");
                    report.failed += 1;
                }
            }
        }

        for order_id in self.repo.expired_orders(now, limit).await? {
            match self.expire_overdue_order(order_id, now).await {
                Ok(TaskOutcome::Acted) => report.orders += 1,
                Ok(TaskOutcome::NoOp) => {}
                Err(e) => {
                    tracing::warn!(%order_id, error = %e, "Overdue order not cancelled");
                    report.failed += 1;
                }
            }
        }

        if report.preorders + report.orders > 0 {
            metrics::counter!("saga_expiry_sweep_total", "kind" => "preorder")
                .increment(report.preorders as u64);
            metrics::counter!("saga_expiry_sweep_total", "kind" => "order")
                .increment(report.orders as u64);
            tracing::info!(
                preorders = report.preorders,
                orders = report.orders,
                "Expiry sweep cancelled overdue work"
            );
        }
        Ok(report)
    }

    async fn expire_overdue_order(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<TaskOutcome> {
        if let Some(payment) = self.repo.payment_for_order(order_id).await?
            && payment.status == PaymentStatus::Pending
            && payment.expire_at <= now
        {
            let task = DelayedTask::ExpirePayment {
                payment_id: payment.id,
            };
            return self.handle_delayed_task(task).await;
        }
        self.handle_delayed_task(DelayedTask::CancelOrderIfUnpaid { order_id }).await
    }

    async fn cancel_on_timeout(&self, order_id: OrderId, reason: &str) -> Result<TaskOutcome> {
        match self.cancel_order(order_id, reason).await {
            Ok(outcome) if outcome.already_cancelled => Ok(TaskOutcome::NoOp),
            Ok(_) => Ok(TaskOutcome::Acted),
            // Paid between the lookup and the cancel.
            Err(SagaError::OrderStatusInvalid { .. }) => Ok(TaskOutcome::NoOp),
            Err(e) => Err(e),
        }
    }

    /// Rolls back the stock, ticket and coupon held by a preorder.
    ///
    /// Each step tolerates having already run. Guard rejections are logged
    /// and skipped; infrastructure errors abort so the caller can retry.
    pub(super) async fn release_resources(&self, preorder: &Preorder) -> Result<()> {
        let preorder_id = preorder.id;

        match self
            .inventory
            .return_pre_inventory(preorder_id, preorder.product_id, preorder.quantity)
            .await
        {
            Ok(_) => {}
            Err(InventoryError::AlreadyConfirmed { .. }) => {
                tracing::warn!(%preorder_id, "Stock already sold, not unfreezing");
            }
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(%preorder_id, error = %e, "Unfreeze rejected, skipping");
            }
        }

        let report = self.inventory.return_token(preorder_id, &[]).await?;
        tracing::debug!(
            %preorder_id,
            restored = report.restored,
            skipped = report.skipped,
            "Admission capacity returned"
        );

        if let Some(coupon_id) = preorder.coupon_id {
            match self
                .coupons
                .release_coupon(coupon_id, preorder.user_id, preorder_id)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(%preorder_id, %coupon_id, error = %e, "Coupon release rejected, skipping");
                }
            }
        }
        Ok(())
    }
}
