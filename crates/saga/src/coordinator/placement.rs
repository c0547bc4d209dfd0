use std::time::Instant;

use common::{OrderId, PreorderId};

use super::{OrderPlacementSaga, observe};
use crate::delay::DelayedTask;
use crate::error::{Result, SagaError};
use crate::model::{Order, PlaceOutcome};
use crate::state::OrderStatus;

impl OrderPlacementSaga {
    /// Promotes a pending preorder to an order.
    ///
    /// Idempotent by preorder id: a repeat call returns the existing order.
    /// Fails with [`SagaError::PreorderExpired`] once the preorder's window
    /// has passed or it was cancelled, and with
    /// [`SagaError::PreorderNotReady`] while its stock is not frozen yet.
    #[tracing::instrument(skip(self))]
    pub async fn place_order(&self, preorder_id: PreorderId) -> Result<Order> {
        let started = Instant::now();
        let now = self.now();
        let order_id = OrderId::new(self.ids.next_id());
        let expire_time = now + self.config.order_ttl;

        let outcome = self
            .repo
            .place_order(preorder_id, order_id, expire_time, now)
            .await?;

        match outcome {
            PlaceOutcome::Created(order) => {
                self.schedule(
                    DelayedTask::CancelOrderIfUnpaid { order_id: order.id },
                    order.expire_time,
                )
                .await?;
                metrics::counter!("saga_orders_placed_total").increment(1);
                observe("place_order", started);
                tracing::info!(order_id = %order.id, "Order placed");
                Ok(order)
            }
            PlaceOutcome::Existing(order) => {
                tracing::debug!(order_id = %order.id, "Order already placed");
                Ok(order)
            }
        }
    }

    /// Moves a paid order to completed.
    #[tracing::instrument(skip(self))]
    pub async fn complete_order(&self, order_id: OrderId) -> Result<Order> {
        let completed = self
            .repo
            .transition_order(
                order_id,
                &[OrderStatus::Paid],
                OrderStatus::Completed,
                None,
                self.now(),
            )
            .await?;

        let order = self.get_order(order_id).await?;
        if !completed && order.status != OrderStatus::Completed {
            return Err(SagaError::OrderStatusInvalid {
                order_id,
                status: order.status,
                op: "complete",
            });
        }
        if completed {
            tracing::info!(%order_id, "Order completed");
        }
        Ok(order)
    }
}
