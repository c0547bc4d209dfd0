use std::time::Instant;

use common::{Money, PreorderId};
use coupon::ValidateCoupon;
use inventory::{AdmissionItem, InventoryError};
use uuid::Uuid;

use super::{OrderPlacementSaga, observe};
use crate::bus::{BusMessage, CHECKOUT_TOPIC};
use crate::delay::DelayedTask;
use crate::error::{Result, SagaError};
use crate::model::{
    CheckoutEvent, CheckoutReceipt, CheckoutRequest, FreezeOutcome, Preorder, PreorderItem,
};
use crate::state::PreorderStatus;
use crate::transactional::CommitOutcome;

/// What a checkout has acquired so far, for inline compensation.
#[derive(Default)]
struct Acquired {
    coupon_locked: bool,
    half_message: Option<Uuid>,
}

impl OrderPlacementSaga {
    /// Admits a checkout and hands it to the pre-freeze consumer.
    ///
    /// Acquires an admission ticket, optionally locks a coupon, then commits
    /// the preorder and its checkout event together through the two-phase
    /// publisher. A repeated checkout for an existing preorder returns the
    /// original receipt flagged as a duplicate.
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, product_id = %request.product_id))]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt> {
        let started = Instant::now();
        validate(&request)?;

        let preorder_id = request
            .preorder_id
            .unwrap_or_else(|| PreorderId::new(self.ids.next_id()));
        if let Some(existing) = self.repo.preorder(preorder_id).await? {
            return duplicate(&request, &existing);
        }

        let items = [AdmissionItem::new(request.product_id, request.quantity)];
        match self.inventory.try_get_token(preorder_id, &items).await {
            Ok(_) => {}
            Err(InventoryError::DuplicateTicket(_)) => {
                return match self.repo.preorder(preorder_id).await? {
                    Some(existing) => duplicate(&request, &existing),
                    None => Err(SagaError::DuplicateRequest(preorder_id)),
                };
            }
            Err(e) => {
                metrics::counter!("saga_checkouts_total", "outcome" => "rejected").increment(1);
                return Err(e.into());
            }
        }

        let mut acquired = Acquired::default();
        match self.commit_checkout(preorder_id, &request, &mut acquired).await {
            Ok(receipt) => {
                metrics::counter!("saga_checkouts_total", "outcome" => "accepted").increment(1);
                observe("checkout", started);
                tracing::info!(%preorder_id, payable = %receipt.payable, "Checkout accepted");
                Ok(receipt)
            }
            Err(e) => {
                tracing::warn!(%preorder_id, error = %e, "Checkout failed, compensating");
                self.undo_checkout(preorder_id, &request, acquired).await;
                metrics::counter!("saga_checkouts_total", "outcome" => "failed").increment(1);
                Err(e)
            }
        }
    }

    async fn commit_checkout(
        &self,
        preorder_id: PreorderId,
        request: &CheckoutRequest,
        acquired: &mut Acquired,
    ) -> Result<CheckoutReceipt> {
        let original = request.unit_price.multiply(request.quantity);
        let (discount, payable) = match request.coupon_id {
            None => (Money::zero(), original),
            Some(coupon_id) => {
                let merchant_id = request.merchant_id.ok_or_else(|| {
                    SagaError::InvalidRequest("merchant_id is required with a coupon".into())
                })?;
                let quote = self
                    .coupons
                    .validate_coupon(ValidateCoupon {
                        coupon_id,
                        user_id: request.user_id,
                        merchant_id,
                        amount: original,
                        preorder_id: Some(preorder_id),
                    })
                    .await?;
                self.coupons
                    .lock_coupon(coupon_id, request.user_id, preorder_id)
                    .await?;
                acquired.coupon_locked = true;
                (quote.discount, quote.payable)
            }
        };

        let now = self.now();
        let preorder = Preorder {
            id: preorder_id,
            user_id: request.user_id,
            product_id: request.product_id,
            merchant_id: request.merchant_id,
            quantity: request.quantity,
            unit_price: request.unit_price,
            coupon_id: request.coupon_id,
            original,
            discount,
            payable,
            status: PreorderStatus::Pending,
            snapshot: request.snapshot.clone(),
            cancel_reason: None,
            expire_at: now + self.config.preorder_ttl,
            created_at: now,
        };

        let message = BusMessage::new(
            CHECKOUT_TOPIC,
            preorder_id.to_string(),
            &CheckoutEvent::from(&preorder),
        )?;
        let half = self.publisher.prepare(message).await?;
        acquired.half_message = Some(half);

        if !self.repo.insert_preorder(&preorder).await? {
            return Err(SagaError::DuplicateRequest(preorder_id));
        }
        // The preorder is durable. From here recovery owns the message and
        // nothing may be compensated inline.
        acquired.half_message = None;

        match self.publisher.commit(half, self).await {
            Ok(CommitOutcome::Delivered) => {}
            Ok(CommitOutcome::Pending) => {
                tracing::warn!(%preorder_id, "Checkout event left for outbox recovery");
            }
            Err(e) => {
                tracing::warn!(%preorder_id, error = %e, "Checkout event commit failed, left for recovery");
            }
        }
        Ok(CheckoutReceipt::for_preorder(&preorder, false))
    }

    async fn undo_checkout(&self, preorder_id: PreorderId, request: &CheckoutRequest, acquired: Acquired) {
        metrics::counter!("saga_compensations_total", "step" => "checkout").increment(1);
        if let Some(half) = acquired.half_message
            && let Err(e) = self.publisher.rollback(half).await
        {
            tracing::error!(%preorder_id, error = %e, "Half message rollback failed during checkout rollback");
        }
        if acquired.coupon_locked
            && let Some(coupon_id) = request.coupon_id
            && let Err(e) = self
                .coupons
                .release_coupon(coupon_id, request.user_id, preorder_id)
                .await
        {
            tracing::error!(%preorder_id, %coupon_id, error = %e, "Coupon release failed during checkout rollback");
        }
        if let Err(e) = self.inventory.return_token(preorder_id, &[]).await {
            tracing::error!(%preorder_id, error = %e, "Token return failed during checkout rollback");
        }
    }

    /// Pre-freeze step: freezes stock for a checkout event and records the item snapshot.
    ///
    /// The preorder's expiry timer is scheduled first so an event that is
    /// never handled still gets cleaned up. A transient failure is returned
    /// for redelivery; any other failure rolls the checkout back in reverse
    /// (stock, coupon, ticket, preorder).
    #[tracing::instrument(skip(self, event), fields(preorder_id = %event.preorder_id))]
    pub async fn handle_checkout_event(&self, event: CheckoutEvent) -> Result<FreezeOutcome> {
        let started = Instant::now();
        let Some(preorder) = self.repo.preorder(event.preorder_id).await? else {
            tracing::debug!("Preorder gone, skipping checkout event");
            return Ok(FreezeOutcome::Skipped);
        };
        if preorder.status != PreorderStatus::Pending {
            tracing::debug!(status = %preorder.status, "Preorder already resolved");
            return Ok(FreezeOutcome::Skipped);
        }

        self.schedule(
            DelayedTask::CancelPreorderIfUnpaid {
                preorder_id: preorder.id,
            },
            preorder.expire_at,
        )
        .await?;

        match self.pre_freeze(&preorder, &event).await {
            Ok(()) => {
                observe("pre_freeze", started);
                tracing::info!(quantity = preorder.quantity, "Stock frozen for preorder");
                Ok(FreezeOutcome::Frozen)
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Pre-freeze failed, compensating");
                metrics::counter!("saga_compensations_total", "step" => "pre_freeze").increment(1);
                self.release_resources(&preorder).await?;
                self.repo.delete_pending_preorder(preorder.id).await?;
                Ok(FreezeOutcome::Compensated)
            }
        }
    }

    async fn pre_freeze(&self, preorder: &Preorder, event: &CheckoutEvent) -> Result<()> {
        self.inventory
            .decrease_pre_inventory(preorder.id, preorder.product_id, preorder.quantity)
            .await?;
        self.repo
            .insert_preorder_item(&PreorderItem {
                preorder_id: preorder.id,
                product_id: preorder.product_id,
                quantity: preorder.quantity,
                unit_price: preorder.unit_price,
                snapshot: event.snapshot.clone(),
            })
            .await?;
        Ok(())
    }
}

fn validate(request: &CheckoutRequest) -> Result<()> {
    if request.quantity <= 0 {
        return Err(SagaError::InvalidRequest(format!(
            "quantity must be positive, got {}",
            request.quantity
        )));
    }
    if !request.unit_price.is_positive() {
        return Err(SagaError::InvalidRequest(format!(
            "unit price must be positive, got {}",
            request.unit_price
        )));
    }
    Ok(())
}

fn duplicate(request: &CheckoutRequest, existing: &Preorder) -> Result<CheckoutReceipt> {
    if existing.user_id != request.user_id {
        return Err(SagaError::DuplicateRequest(existing.id));
    }
    tracing::info!(preorder_id = %existing.id, "Duplicate checkout");
    metrics::counter!("saga_checkouts_total", "outcome" => "duplicate").increment(1);
    Ok(CheckoutReceipt::for_preorder(existing, true))
}
