use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, CouponTemplateId, OrderId, PreorderId, UserId};
use tokio::sync::Mutex;

use crate::error::{CouponError, Result};
use crate::model::{CouponInstance, CouponOutcome, CouponStatus, CouponTemplate, NewTemplate};
use crate::store::CouponStore;

#[derive(Default)]
struct Tables {
    templates: HashMap<CouponTemplateId, CouponTemplate>,
    coupons: BTreeMap<CouponId, CouponInstance>,
    next_template: i64,
    next_coupon: i64,
}

impl Tables {
    fn owned(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<&mut CouponInstance> {
        self.coupons
            .get_mut(&coupon_id)
            .filter(|c| c.user_id == user_id)
            .ok_or(CouponError::CouponNotFound { coupon_id, user_id })
    }

    fn template_of(&self, coupon: &CouponInstance) -> Result<CouponTemplate> {
        self.templates
            .get(&coupon.template_id)
            .cloned()
            .ok_or_else(|| CouponError::Corrupt(format!("template {} missing", coupon.template_id)))
    }
}

/// In-memory coupon store. Each call runs under one lock.
#[derive(Clone, Default)]
pub struct InMemoryCouponStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryCouponStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn insert_template(&self, template: NewTemplate) -> Result<CouponTemplate> {
        let mut tables = self.tables.lock().await;
        tables.next_template += 1;
        let id = CouponTemplateId::new(tables.next_template);
        let stored = CouponTemplate::from_new(id, template);
        tables.templates.insert(id, stored.clone());
        Ok(stored)
    }

    async fn template(&self, template_id: CouponTemplateId) -> Result<Option<CouponTemplate>> {
        Ok(self.tables.lock().await.templates.get(&template_id).cloned())
    }

    async fn claim(
        &self,
        template_id: CouponTemplateId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<CouponInstance> {
        let mut tables = self.tables.lock().await;
        let template = tables
            .templates
            .get(&template_id)
            .ok_or(CouponError::TemplateNotFound(template_id))?;
        template.check_window(now)?;

        let held = tables
            .coupons
            .values()
            .filter(|c| c.template_id == template_id && c.user_id == user_id)
            .count() as i64;
        template.check_user_limit(user_id, held)?;
        if !template.has_capacity() {
            return Err(CouponError::SoldOut(template_id));
        }

        if let Some(template) = tables.templates.get_mut(&template_id) {
            template.issued_quantity += 1;
        }
        tables.next_coupon += 1;
        let coupon = CouponInstance {
            id: CouponId::new(tables.next_coupon),
            template_id,
            user_id,
            status: CouponStatus::Unused,
            locked_preorder: None,
            used_order_id: None,
            claimed_at: now,
            updated_at: now,
        };
        tables.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon)
    }

    async fn coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<Option<(CouponInstance, CouponTemplate)>> {
        let tables = self.tables.lock().await;
        let Some(coupon) = tables
            .coupons
            .get(&coupon_id)
            .filter(|c| c.user_id == user_id)
        else {
            return Ok(None);
        };
        Ok(Some((coupon.clone(), tables.template_of(coupon)?)))
    }

    async fn lock(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        now: DateTime<Utc>,
    ) -> Result<CouponOutcome> {
        let mut tables = self.tables.lock().await;
        let snapshot = tables.owned(coupon_id, user_id)?.clone();
        let template = tables.template_of(&snapshot)?;

        let outcome = snapshot.plan_lock(&template, preorder_id, now)?;
        if outcome.is_applied() {
            let coupon = tables.owned(coupon_id, user_id)?;
            coupon.status = CouponStatus::Locked;
            coupon.locked_preorder = Some(preorder_id);
            coupon.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    async fn release(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
    ) -> Result<CouponOutcome> {
        let mut tables = self.tables.lock().await;
        let coupon = tables.owned(coupon_id, user_id)?;

        let outcome = coupon.plan_release(preorder_id);
        if outcome.is_applied() {
            coupon.status = CouponStatus::Unused;
            coupon.locked_preorder = None;
            coupon.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    async fn redeem(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        order_id: OrderId,
    ) -> Result<CouponOutcome> {
        let mut tables = self.tables.lock().await;
        let coupon = tables.owned(coupon_id, user_id)?;

        let outcome = coupon.plan_redeem(preorder_id, order_id)?;
        if outcome.is_applied() {
            coupon.status = CouponStatus::Used;
            coupon.used_order_id = Some(order_id);
            coupon.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(CouponInstance, CouponTemplate)>> {
        let tables = self.tables.lock().await;
        tables
            .coupons
            .values()
            .filter(|c| c.user_id == user_id)
            .map(|c| Ok((c.clone(), tables.template_of(c)?)))
            .collect()
    }
}
