//! Coupon templates, instances and the pure rules of their state machine.

use chrono::{DateTime, Utc};
use common::{CouponId, CouponTemplateId, MerchantId, Money, OrderId, PreorderId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{CouponError, Result};

/// How a template computes its discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountRule {
    /// A fixed amount off the order.
    FixedAmount { amount_off: Money },
    /// A percentage off the order, optionally capped.
    Percentage {
        percent_off: i32,
        max_discount: Option<Money>,
    },
}

impl DiscountRule {
    /// Returns the column value of the kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscountRule::FixedAmount { .. } => "FIXED_AMOUNT",
            DiscountRule::Percentage { .. } => "PERCENTAGE",
        }
    }

    /// Discount granted on `amount`. Never exceeds `amount`.
    pub fn discount_for(&self, amount: Money) -> Money {
        let discount = match *self {
            DiscountRule::FixedAmount { amount_off } => amount_off,
            DiscountRule::Percentage {
                percent_off,
                max_discount,
            } => {
                let raw = Money::from_cents(amount.cents() * i64::from(percent_off) / 100);
                match max_discount {
                    Some(cap) => raw.min(cap),
                    None => raw,
                }
            }
        };
        discount.min(amount)
    }

    fn validate(&self) -> Result<()> {
        match *self {
            DiscountRule::FixedAmount { amount_off } if !amount_off.is_positive() => Err(
                CouponError::InvalidTemplate("fixed amount must be positive".into()),
            ),
            DiscountRule::Percentage { percent_off, .. } if !(1..=100).contains(&percent_off) => {
                Err(CouponError::InvalidTemplate(format!(
                    "percent off {percent_off} outside 1..=100"
                )))
            }
            DiscountRule::Percentage {
                max_discount: Some(cap),
                ..
            } if !cap.is_positive() => Err(CouponError::InvalidTemplate(
                "discount cap must be positive".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// A template to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub merchant_id: Option<MerchantId>,
    pub name: String,
    pub rule: DiscountRule,
    pub min_spend: Money,
    /// Maximum number of coupons to issue; 0 means unlimited.
    pub total_quantity: i64,
    /// Maximum number of coupons one user may claim; 0 means unlimited.
    pub per_user_limit: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl NewTemplate {
    /// Checks the template definition.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CouponError::InvalidTemplate("name is empty".into()));
        }
        if self.total_quantity < 0 || self.per_user_limit < 0 {
            return Err(CouponError::InvalidTemplate(
                "quantities must not be negative".into(),
            ));
        }
        if self.min_spend.cents() < 0 {
            return Err(CouponError::InvalidTemplate(
                "minimum spend must not be negative".into(),
            ));
        }
        if self.valid_until <= self.valid_from {
            return Err(CouponError::InvalidTemplate(
                "validity window is empty".into(),
            ));
        }
        self.rule.validate()
    }
}

/// A published coupon campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponTemplate {
    pub id: CouponTemplateId,
    pub merchant_id: Option<MerchantId>,
    pub name: String,
    pub rule: DiscountRule,
    pub min_spend: Money,
    pub total_quantity: i64,
    pub issued_quantity: i64,
    pub per_user_limit: i64,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl CouponTemplate {
    /// Builds the stored template from its definition.
    pub fn from_new(id: CouponTemplateId, new: NewTemplate) -> Self {
        Self {
            id,
            merchant_id: new.merchant_id,
            name: new.name,
            rule: new.rule,
            min_spend: new.min_spend,
            total_quantity: new.total_quantity,
            issued_quantity: 0,
            per_user_limit: new.per_user_limit,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
        }
    }

    /// Returns true once the validity window has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    /// Checks that `now` falls inside the validity window.
    pub fn check_window(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.valid_from {
            return Err(CouponError::NotYetValid(self.id));
        }
        if self.is_expired(now) {
            return Err(CouponError::Expired(self.id));
        }
        Ok(())
    }

    /// Returns true if another coupon may be issued.
    pub fn has_capacity(&self) -> bool {
        self.total_quantity == 0 || self.issued_quantity < self.total_quantity
    }

    /// Checks whether a user holding `held` coupons may claim another.
    pub fn check_user_limit(&self, user_id: UserId, held: i64) -> Result<()> {
        if self.per_user_limit > 0 && held >= self.per_user_limit {
            return Err(CouponError::LimitExceeded {
                template_id: self.id,
                user_id,
                limit: self.per_user_limit,
            });
        }
        Ok(())
    }
}

/// Stored status of a coupon instance.
///
/// ```text
/// UNUSED ──lock──► LOCKED ──redeem──► USED
///    ▲               │
///    └───release─────┘
/// UNUSED ──(window passes)──► EXPIRED   (computed, never written)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    Unused,
    Locked,
    Used,
    Expired,
}

impl CouponStatus {
    /// Returns the column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Unused => "UNUSED",
            CouponStatus::Locked => "LOCKED",
            CouponStatus::Used => "USED",
            CouponStatus::Expired => "EXPIRED",
        }
    }

    /// Parses a column value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "UNUSED" => Ok(CouponStatus::Unused),
            "LOCKED" => Ok(CouponStatus::Locked),
            "USED" => Ok(CouponStatus::Used),
            "EXPIRED" => Ok(CouponStatus::Expired),
            other => Err(CouponError::Corrupt(format!("coupon status {other}"))),
        }
    }
}

impl std::fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A coupon claimed by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponInstance {
    pub id: CouponId,
    pub template_id: CouponTemplateId,
    pub user_id: UserId,
    pub status: CouponStatus,
    /// Set while LOCKED, and kept on USED for traceability.
    pub locked_preorder: Option<PreorderId>,
    pub used_order_id: Option<OrderId>,
    pub claimed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a coupon transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponOutcome {
    /// The transition was applied.
    Applied,
    /// The coupon was already in the requested state for this caller.
    NoOp,
}

impl CouponOutcome {
    /// Returns true if the call changed the coupon.
    pub fn is_applied(&self) -> bool {
        matches!(self, CouponOutcome::Applied)
    }
}

impl CouponInstance {
    /// Status as seen by callers: an UNUSED coupon whose window has passed is EXPIRED.
    pub fn effective_status(&self, template: &CouponTemplate, now: DateTime<Utc>) -> CouponStatus {
        if self.status == CouponStatus::Unused && template.is_expired(now) {
            CouponStatus::Expired
        } else {
            self.status
        }
    }

    /// Decides a lock by `preorder_id`. Re-locking by the same preorder is a no-op.
    pub fn plan_lock(
        &self,
        template: &CouponTemplate,
        preorder_id: PreorderId,
        now: DateTime<Utc>,
    ) -> Result<CouponOutcome> {
        match self.status {
            CouponStatus::Locked if self.locked_preorder == Some(preorder_id) => {
                Ok(CouponOutcome::NoOp)
            }
            CouponStatus::Locked => Err(self.locked_by_other()),
            CouponStatus::Unused => {
                template.check_window(now)?;
                Ok(CouponOutcome::Applied)
            }
            status @ (CouponStatus::Used | CouponStatus::Expired) => {
                Err(self.invalid(status, "lock"))
            }
        }
    }

    /// Decides a release by `preorder_id`. Anything other than a lock held by
    /// this preorder is left alone.
    pub fn plan_release(&self, preorder_id: PreorderId) -> CouponOutcome {
        if self.status == CouponStatus::Locked && self.locked_preorder == Some(preorder_id) {
            CouponOutcome::Applied
        } else {
            CouponOutcome::NoOp
        }
    }

    /// Decides a redeem of the lock held by `preorder_id` for `order_id`.
    /// Redeeming again for the same order is a no-op.
    pub fn plan_redeem(&self, preorder_id: PreorderId, order_id: OrderId) -> Result<CouponOutcome> {
        match self.status {
            CouponStatus::Used if self.used_order_id == Some(order_id) => Ok(CouponOutcome::NoOp),
            CouponStatus::Locked if self.locked_preorder == Some(preorder_id) => {
                Ok(CouponOutcome::Applied)
            }
            CouponStatus::Locked => Err(self.locked_by_other()),
            status => Err(self.invalid(status, "redeem")),
        }
    }

    fn locked_by_other(&self) -> CouponError {
        match self.locked_preorder {
            Some(holder) => CouponError::LockedByOther {
                coupon_id: self.id,
                holder,
            },
            None => self.invalid(self.status, "lock"),
        }
    }

    fn invalid(&self, status: CouponStatus, op: &'static str) -> CouponError {
        CouponError::StatusInvalid {
            coupon_id: self.id,
            status,
            op,
        }
    }
}

/// A coupon together with its template and caller-visible status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponView {
    pub coupon: CouponInstance,
    pub template: CouponTemplate,
    pub effective_status: CouponStatus,
}

/// The discount a coupon grants on an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountQuote {
    pub coupon_id: CouponId,
    pub original: Money,
    pub discount: Money,
    pub payable: Money,
}

/// A request to check a coupon against an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateCoupon {
    pub coupon_id: CouponId,
    pub user_id: UserId,
    pub merchant_id: MerchantId,
    pub amount: Money,
    /// A coupon already locked by this preorder is accepted.
    pub preorder_id: Option<PreorderId>,
}

/// Checks ownership, status, window, merchant scope and minimum spend.
pub fn quote(
    request: &ValidateCoupon,
    coupon: &CouponInstance,
    template: &CouponTemplate,
    now: DateTime<Utc>,
) -> Result<DiscountQuote> {
    if coupon.user_id != request.user_id {
        return Err(CouponError::CouponNotFound {
            coupon_id: request.coupon_id,
            user_id: request.user_id,
        });
    }

    match coupon.effective_status(template, now) {
        CouponStatus::Unused => {}
        CouponStatus::Locked
            if request.preorder_id.is_some() && coupon.locked_preorder == request.preorder_id => {}
        CouponStatus::Locked => return Err(coupon.locked_by_other()),
        CouponStatus::Expired => return Err(CouponError::Expired(template.id)),
        status => return Err(coupon.invalid(status, "validate")),
    }
    template.check_window(now)?;

    if let Some(expected) = template.merchant_id
        && expected != request.merchant_id
    {
        return Err(CouponError::MerchantMismatch {
            coupon_id: coupon.id,
            expected,
            actual: request.merchant_id,
        });
    }

    if request.amount < template.min_spend {
        return Err(CouponError::ThresholdNotMet {
            coupon_id: coupon.id,
            min_spend: template.min_spend,
            amount: request.amount,
        });
    }

    let discount = template.rule.discount_for(request.amount);
    Ok(DiscountQuote {
        coupon_id: coupon.id,
        original: request.amount,
        discount,
        payable: request.amount.saturating_sub(discount),
    })
}
