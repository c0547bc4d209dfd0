use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, CouponTemplateId, OrderId, PreorderId, UserId};

use crate::error::Result;
use crate::model::{CouponInstance, CouponOutcome, CouponTemplate, NewTemplate};

/// Storage for coupon templates and instances.
///
/// Claim, lock and redeem are each one transaction: the rows they depend on
/// are read under a lock and the change is applied as a conditional update,
/// so a guard that fails after the read surfaces as a typed conflict.
#[async_trait]
pub trait CouponStore: Send + Sync {
    /// Stores a validated template.
    async fn insert_template(&self, template: NewTemplate) -> Result<CouponTemplate>;

    /// Loads a template.
    async fn template(&self, template_id: CouponTemplateId) -> Result<Option<CouponTemplate>>;

    /// Issues one coupon of the template to the user, enforcing the validity
    /// window, the per-user limit and the issuance cap together.
    async fn claim(
        &self,
        template_id: CouponTemplateId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<CouponInstance>;

    /// Loads a coupon owned by `user_id` together with its template.
    async fn coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<Option<(CouponInstance, CouponTemplate)>>;

    /// UNUSED → LOCKED(preorder). Idempotent for the same preorder.
    async fn lock(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        now: DateTime<Utc>,
    ) -> Result<CouponOutcome>;

    /// LOCKED(preorder) → UNUSED. A no-op unless locked by this preorder.
    async fn release(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
    ) -> Result<CouponOutcome>;

    /// LOCKED(preorder) → USED(order). Idempotent for the same order.
    async fn redeem(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        order_id: OrderId,
    ) -> Result<CouponOutcome>;

    /// Lists the user's coupons with their templates, oldest first.
    async fn list_for_user(&self, user_id: UserId)
    -> Result<Vec<(CouponInstance, CouponTemplate)>>;
}
