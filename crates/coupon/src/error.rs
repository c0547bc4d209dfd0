use common::{CouponId, CouponTemplateId, HasStatus, MerchantId, Money, PreorderId, StatusCode, UserId};
use thiserror::Error;

use crate::model::CouponStatus;

/// Errors that can occur in the coupon engine.
#[derive(Debug, Error)]
pub enum CouponError {
    /// The template definition is malformed.
    #[error("Invalid coupon template: {0}")]
    InvalidTemplate(String),

    /// No template with this id exists.
    #[error("Coupon template not found: {0}")]
    TemplateNotFound(CouponTemplateId),

    /// No coupon with this id is owned by the user.
    #[error("Coupon {coupon_id} not found for user {user_id}")]
    CouponNotFound { coupon_id: CouponId, user_id: UserId },

    /// Every coupon of the template has been claimed.
    #[error("Coupon template {0} is sold out")]
    SoldOut(CouponTemplateId),

    /// The user already holds the maximum number of coupons of this template.
    #[error("User {user_id} reached the limit of {limit} for template {template_id}")]
    LimitExceeded {
        template_id: CouponTemplateId,
        user_id: UserId,
        limit: i64,
    },

    /// The validity window has passed.
    #[error("Coupon template {0} has expired")]
    Expired(CouponTemplateId),

    /// The validity window has not started.
    #[error("Coupon template {0} is not valid yet")]
    NotYetValid(CouponTemplateId),

    /// The coupon is not in a state that allows the operation.
    #[error("Coupon {coupon_id} is {status}, cannot {op}")]
    StatusInvalid {
        coupon_id: CouponId,
        status: CouponStatus,
        op: &'static str,
    },

    /// The coupon is locked by another preorder.
    #[error("Coupon {coupon_id} is locked by preorder {holder}")]
    LockedByOther { coupon_id: CouponId, holder: PreorderId },

    /// A conditional update found its guard false after the row was read.
    #[error("Coupon {coupon_id} changed concurrently during {op}")]
    Conflict { coupon_id: CouponId, op: &'static str },

    /// The coupon belongs to a different merchant.
    #[error("Coupon {coupon_id} is scoped to merchant {expected}, order is for {actual}")]
    MerchantMismatch {
        coupon_id: CouponId,
        expected: MerchantId,
        actual: MerchantId,
    },

    /// The order amount is below the coupon's minimum spend.
    #[error("Coupon {coupon_id} requires a minimum spend of {min_spend}, order is {amount}")]
    ThresholdNotMet {
        coupon_id: CouponId,
        min_spend: Money,
        amount: Money,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored data could not be interpreted.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl CouponError {
    /// Returns true if the error came from the storage tier rather than a guard.
    pub fn is_transient(&self) -> bool {
        matches!(self, CouponError::Database(_))
    }
}

impl HasStatus for CouponError {
    fn status_code(&self) -> StatusCode {
        match self {
            CouponError::InvalidTemplate(_) => StatusCode::InvalidParam,
            CouponError::TemplateNotFound(_) | CouponError::CouponNotFound { .. } => {
                StatusCode::CouponNotFound
            }
            CouponError::SoldOut(_) => StatusCode::CouponSoldOut,
            CouponError::LimitExceeded { .. } => StatusCode::CouponLimitExceeded,
            CouponError::Expired(_) => StatusCode::CouponExpired,
            CouponError::NotYetValid(_)
            | CouponError::StatusInvalid { .. }
            | CouponError::LockedByOther { .. }
            | CouponError::Conflict { .. } => StatusCode::CouponStatusInvalid,
            CouponError::MerchantMismatch { .. } => StatusCode::MerchantMismatch,
            CouponError::ThresholdNotMet { .. } => StatusCode::CouponThresholdNotMet,
            CouponError::Database(_) | CouponError::Migration(_) | CouponError::Corrupt(_) => {
                StatusCode::InternalError
            }
        }
    }
}

/// Result type for coupon operations.
pub type Result<T> = std::result::Result<T, CouponError>;
