//! Coupon service exposing the claim/lock/release/redeem surface.

use std::sync::Arc;

use common::{Clock, CouponId, CouponTemplateId, OrderId, PreorderId, UserId};

use crate::error::{CouponError, Result};
use crate::model::{
    CouponInstance, CouponOutcome, CouponTemplate, CouponView, DiscountQuote, NewTemplate,
    ValidateCoupon, quote,
};
use crate::store::CouponStore;

/// Service for managing coupons.
pub struct CouponService {
    store: Arc<dyn CouponStore>,
    clock: Arc<dyn Clock>,
}

impl CouponService {
    /// Creates a new coupon service.
    pub fn new(store: Arc<dyn CouponStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Publishes a coupon template.
    #[tracing::instrument(skip(self, template), fields(name = %template.name))]
    pub async fn publish_coupon(&self, template: NewTemplate) -> Result<CouponTemplate> {
        template.validate()?;
        let stored = self.store.insert_template(template).await?;
        tracing::info!(template_id = %stored.id, "Coupon template published");
        Ok(stored)
    }

    /// Claims one coupon of a template for a user.
    #[tracing::instrument(skip(self))]
    pub async fn claim_coupon(
        &self,
        template_id: CouponTemplateId,
        user_id: UserId,
    ) -> Result<CouponInstance> {
        let coupon = self
            .store
            .claim(template_id, user_id, self.clock.now())
            .await?;
        tracing::info!(coupon_id = %coupon.id, "Coupon claimed");
        Ok(coupon)
    }

    /// Locks a coupon for a preorder.
    #[tracing::instrument(skip(self))]
    pub async fn lock_coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
    ) -> Result<CouponOutcome> {
        let result = self
            .store
            .lock(coupon_id, user_id, preorder_id, self.clock.now())
            .await;
        record("lock", &result);
        result
    }

    /// Releases a coupon locked by a preorder.
    #[tracing::instrument(skip(self))]
    pub async fn release_coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
    ) -> Result<CouponOutcome> {
        let result = self.store.release(coupon_id, user_id, preorder_id).await;
        record("release", &result);
        result
    }

    /// Marks a coupon locked by a preorder as used by its order.
    #[tracing::instrument(skip(self))]
    pub async fn redeem_coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        order_id: OrderId,
    ) -> Result<CouponOutcome> {
        let result = self
            .store
            .redeem(coupon_id, user_id, preorder_id, order_id)
            .await;
        record("redeem", &result);
        result
    }

    /// Checks a coupon against an order and quotes its discount.
    #[tracing::instrument(skip(self))]
    pub async fn validate_coupon(&self, request: ValidateCoupon) -> Result<DiscountQuote> {
        let (coupon, template) = self
            .store
            .coupon(request.coupon_id, request.user_id)
            .await?
            .ok_or(CouponError::CouponNotFound {
                coupon_id: request.coupon_id,
                user_id: request.user_id,
            })?;
        quote(&request, &coupon, &template, self.clock.now())
    }

    /// Lists a user's coupons with their current effective status.
    pub async fn list_user_coupons(&self, user_id: UserId) -> Result<Vec<CouponView>> {
        let now = self.clock.now();
        Ok(self
            .store
            .list_for_user(user_id)
            .await?
            .into_iter()
            .map(|(coupon, template)| {
                let effective_status = coupon.effective_status(&template, now);
                CouponView {
                    coupon,
                    template,
                    effective_status,
                }
            })
            .collect())
    }
}

fn record(op: &'static str, result: &Result<CouponOutcome>) {
    let outcome = match result {
        Ok(CouponOutcome::Applied) => "applied",
        Ok(CouponOutcome::NoOp) => "noop",
        Err(e) if e.is_transient() => {
            tracing::error!(op, error = %e, "Coupon transition failed");
            "error"
        }
        Err(e) => {
            tracing::warn!(op, error = %e, "Coupon transition rejected");
            "rejected"
        }
    };
    metrics::counter!("coupon_locks_total", "op" => op, "outcome" => outcome).increment(1);
}
