use std::time::Instant;

use common::{OrderId, PaymentId};
use inventory::InventoryError;

use super::{OrderPlacementSaga, observe};
use crate::delay::DelayedTask;
use crate::error::{Result, SagaError};
use crate::model::{CancelOutcome, Order, Payment};
use crate::state::{OrderStatus, PaymentStatus};

impl OrderPlacementSaga {
    /// Marks an order as paying.
    #[tracing::instrument(skip(self))]
    pub async fn mark_paying(&self, order_id: OrderId) -> Result<Order> {
        let moved = self
            .repo
            .transition_order(
                order_id,
                OrderStatus::PAYABLE,
                OrderStatus::Paying,
                None,
                self.now(),
            )
            .await?;

        let order = self.get_order(order_id).await?;
        if !moved {
            return Err(SagaError::OrderStatusInvalid {
                order_id,
                status: order.status,
                op: "pay",
            });
        }
        Ok(order)
    }

    /// Opens the payment of an order, or returns the one already open.
    ///
    /// Marks the order as paying and schedules the payment's expiry.
    #[tracing::instrument(skip(self))]
    pub async fn create_payment(&self, order_id: OrderId) -> Result<Payment> {
        let order = self.get_order(order_id).await?;
        if let Some(existing) = self.repo.payment_for_order(order_id).await? {
            return Ok(existing);
        }

        let order = self.mark_paying(order.id).await?;
        let now = self.now();
        let payment = Payment {
            id: PaymentId::new(self.ids.next_id()),
            order_id,
            amount: order.payable,
            status: PaymentStatus::Pending,
            expire_at: now + self.config.payment_ttl,
            created_at: now,
            updated_at: now,
        };

        let (payment, created) = self.repo.insert_payment(&payment).await?;
        if created {
            self.schedule(
                DelayedTask::ExpirePayment {
                    payment_id: payment.id,
                },
                payment.expire_at,
            )
            .await?;
            tracing::info!(payment_id = %payment.id, amount = %payment.amount, "Payment created");
        }
        Ok(payment)
    }

    /// Confirms a payment: the order becomes paid, frozen stock is sold,
    /// the admission ticket is consumed and the coupon redeemed.
    ///
    /// Safe to retry; a repeat call re-runs the idempotent follow-up steps.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_payment(&self, payment_id: PaymentId) -> Result<Order> {
        let started = Instant::now();
        let payment = self.get_payment(payment_id).await?;

        match payment.status {
            PaymentStatus::Pending => {
                let now = self.now();
                let paid = self
                    .repo
                    .transition_order(
                        payment.order_id,
                        OrderStatus::PAYABLE,
                        OrderStatus::Paid,
                        None,
                        now,
                    )
                    .await?;
                if !paid {
                    let order = self.get_order(payment.order_id).await?;
                    if !order.status.is_paid() {
                        metrics::counter!("saga_payments_total", "outcome" => "rejected")
                            .increment(1);
                        return Err(SagaError::OrderStatusInvalid {
                            order_id: order.id,
                            status: order.status,
                            op: "confirm payment",
                        });
                    }
                }
                let succeeded = self
                    .repo
                    .transition_payment(
                        payment_id,
                        &[PaymentStatus::Pending],
                        PaymentStatus::Succeeded,
                        now,
                    )
                    .await?;
                if !succeeded {
                    tracing::warn!(%payment_id, "Payment changed state while order was paid");
                }
            }
            PaymentStatus::Succeeded => {
                tracing::debug!(%payment_id, "Payment already confirmed, re-running follow-ups");
            }
            status => {
                return Err(SagaError::PaymentStatusInvalid {
                    payment_id,
                    status,
                    op: "confirm",
                });
            }
        }

        let order = self.get_order(payment.order_id).await?;
        self.settle(&order).await?;
        metrics::counter!("saga_payments_total", "outcome" => "confirmed").increment(1);
        observe("confirm_payment", started);
        tracing::info!(order_id = %order.id, "Payment confirmed");
        Ok(order)
    }

    /// Marks a payment as failed and cancels its order.
    #[tracing::instrument(skip(self))]
    pub async fn fail_payment(&self, payment_id: PaymentId, reason: &str) -> Result<CancelOutcome> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status == PaymentStatus::Succeeded {
            return Err(SagaError::PaymentStatusInvalid {
                payment_id,
                status: payment.status,
                op: "fail",
            });
        }
        self.repo
            .transition_payment(
                payment_id,
                &[PaymentStatus::Pending],
                PaymentStatus::Failed,
                self.now(),
            )
            .await?;
        metrics::counter!("saga_payments_total", "outcome" => "failed").increment(1);
        self.cancel_order(payment.order_id, reason).await
    }

    /// Follow-ups of a paid order. Each one is idempotent.
    async fn settle(&self, order: &Order) -> Result<()> {
        self.inventory
            .decrease_inventory(order.preorder_id, order.product_id, order.quantity)
            .await?;

        match self.inventory.check_token(order.preorder_id, true).await {
            Ok(_) => {}
            Err(InventoryError::TicketNotFound(_)) => {
                tracing::debug!(preorder_id = %order.preorder_id, "Ticket already consumed");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(coupon_id) = order.coupon_id {
            self.coupons
                .redeem_coupon(coupon_id, order.user_id, order.preorder_id, order.id)
                .await?;
        }
        Ok(())
    }
}
