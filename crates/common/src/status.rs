//! Numeric status taxonomy shared by every service response.
//!
//! Status codes are the only cross-service error contract: each response
//! carries a code and a human-readable message, errors never propagate
//! across service boundaries as anything else.

use serde::{Deserialize, Serialize};

/// Shared status codes. Values are grouped by owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum StatusCode {
    StatusOk = 0,

    // General
    InvalidParam = 10001,
    NotFound = 10002,
    InternalError = 10003,
    DuplicateRequest = 10004,

    // Inventory
    InsufficientStock = 20001,
    TicketNotFound = 20002,
    DuplicateTicket = 20003,
    NoRowsAffected = 20004,
    StockAlreadyConfirmed = 20005,
    StockAlreadyCancelled = 20006,

    // Coupon
    CouponNotFound = 30001,
    CouponSoldOut = 30002,
    CouponStatusInvalid = 30003,
    CouponLimitExceeded = 30004,
    CouponExpired = 30005,
    CouponThresholdNotMet = 30006,
    MerchantMismatch = 30007,

    // Order / payment
    PreorderExpired = 40001,
    PreorderNotReady = 40002,
    OrderStatusInvalid = 40003,
    PaymentStatusInvalid = 40004,
}

impl StatusCode {
    const ALL: [StatusCode; 22] = [
        StatusCode::StatusOk,
        StatusCode::InvalidParam,
        StatusCode::NotFound,
        StatusCode::InternalError,
        StatusCode::DuplicateRequest,
        StatusCode::InsufficientStock,
        StatusCode::TicketNotFound,
        StatusCode::DuplicateTicket,
        StatusCode::NoRowsAffected,
        StatusCode::StockAlreadyConfirmed,
        StatusCode::StockAlreadyCancelled,
        StatusCode::CouponNotFound,
        StatusCode::CouponSoldOut,
        StatusCode::CouponStatusInvalid,
        StatusCode::CouponLimitExceeded,
        StatusCode::CouponExpired,
        StatusCode::CouponThresholdNotMet,
        StatusCode::MerchantMismatch,
        StatusCode::PreorderExpired,
        StatusCode::PreorderNotReady,
        StatusCode::OrderStatusInvalid,
        StatusCode::PaymentStatusInvalid,
    ];

    /// Returns the numeric wire value.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns true for codes that a caller may retry without changing the request.
    pub fn is_retryable(self) -> bool {
        matches!(self, StatusCode::InternalError | StatusCode::PreorderNotReady)
    }
}

impl From<StatusCode> for i32 {
    fn from(code: StatusCode) -> Self {
        code as i32
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_i32() == value)
            .ok_or_else(|| format!("unknown status code {value}"))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// Status envelope returned alongside every response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    /// Creates a status with a message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The success status.
    pub fn ok() -> Self {
        Self::new(StatusCode::StatusOk, "ok")
    }

    /// Returns true if this is the success status.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::StatusOk
    }
}

/// Errors that can be reported through the shared status taxonomy.
pub trait HasStatus: std::fmt::Display {
    /// The status code this error maps to.
    fn status_code(&self) -> StatusCode;

    /// Converts the error into a status envelope.
    fn status(&self) -> Status {
        Status::new(self.status_code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_roundtrips_through_wire_value() {
        for code in [
            StatusCode::StatusOk,
            StatusCode::InsufficientStock,
            StatusCode::CouponSoldOut,
            StatusCode::MerchantMismatch,
            StatusCode::PaymentStatusInvalid,
        ] {
            assert_eq!(StatusCode::try_from(code.as_i32()), Ok(code));
        }
        assert!(StatusCode::try_from(99).is_err());
    }

    #[test]
    fn status_code_serializes_as_number() {
        let json = serde_json::to_string(&StatusCode::TicketNotFound).unwrap();
        assert_eq!(json, "20002");
    }

    #[test]
    fn status_envelope() {
        assert!(Status::ok().is_ok());
        let status = Status::new(StatusCode::CouponSoldOut, "sold out");
        assert!(!status.is_ok());
        assert_eq!(status.message, "sold out");
    }

    #[test]
    fn retryable_codes() {
        assert!(StatusCode::InternalError.is_retryable());
        assert!(StatusCode::PreorderNotReady.is_retryable());
        assert!(!StatusCode::InsufficientStock.is_retryable());
    }
}
