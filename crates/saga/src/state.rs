//! Preorder, order and payment state machines.

use serde::{Deserialize, Serialize};

/// The state of a preorder.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Placed
///           └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreorderStatus {
    /// Created at checkout, stock not yet promoted to an order.
    #[default]
    Pending,

    /// Promoted to an order (terminal for the preorder itself).
    Placed,

    /// Released by a timer, an explicit cancel or an order cancellation.
    Cancelled,
}

impl PreorderStatus {
    /// Returns true if the preorder can be placed in this state.
    pub fn can_place(&self) -> bool {
        matches!(self, PreorderStatus::Pending)
    }

    /// Returns the state name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            PreorderStatus::Pending => "PENDING",
            PreorderStatus::Placed => "PLACED",
            PreorderStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PreorderStatus::Pending),
            "PLACED" => Some(PreorderStatus::Placed),
            "CANCELLED" => Some(PreorderStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for PreorderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// PendingPayment ──► Paying ──► Paid ──► Completed
///       │              │
///       └──────────────┴──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order created, no payment yet.
    #[default]
    PendingPayment,

    /// A payment has been opened.
    Paying,

    /// Payment confirmed.
    Paid,

    /// Fulfilled (terminal state).
    Completed,

    /// Cancelled and rolled back (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// States from which an order may start or resume paying.
    pub const PAYABLE: &'static [OrderStatus] = &[OrderStatus::PendingPayment, OrderStatus::Paying];

    /// States from which an order may be cancelled.
    pub const CANCELLABLE: &'static [OrderStatus] = Self::PAYABLE;

    /// Returns true if a payment can be opened or confirmed in this state.
    pub fn can_pay(&self) -> bool {
        Self::PAYABLE.contains(self)
    }

    /// Returns true if the order can be cancelled in this state.
    pub fn can_cancel(&self) -> bool {
        Self::CANCELLABLE.contains(self)
    }

    /// Returns true if the order can be completed in this state.
    pub fn can_complete(&self) -> bool {
        matches!(self, OrderStatus::Paid)
    }

    /// Returns true if payment has been taken.
    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Completed)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// Returns the state name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paying => "PAYING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAYING" => Some(OrderStatus::Paying),
            "PAID" => Some(OrderStatus::Paid),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
    Expired,
}

impl PaymentStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Returns the state name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }

    /// Parses a stored state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PaymentStatus::Pending),
            "SUCCEEDED" => Some(PaymentStatus::Succeeded),
            "FAILED" => Some(PaymentStatus::Failed),
            "EXPIRED" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_pending_preorders_place() {
        assert!(PreorderStatus::Pending.can_place());
        assert!(!PreorderStatus::Placed.can_place());
        assert!(!PreorderStatus::Cancelled.can_place());
    }

    #[test]
    fn test_order_cancel_excludes_paid() {
        assert!(OrderStatus::PendingPayment.can_cancel());
        assert!(OrderStatus::Paying.can_cancel());
        assert!(!OrderStatus::Paid.can_cancel());
        assert!(!OrderStatus::Completed.can_cancel());
        assert!(!OrderStatus::Cancelled.can_cancel());
    }

    #[test]
    fn test_order_pay_and_complete() {
        assert!(OrderStatus::Paying.can_pay());
        assert!(!OrderStatus::Cancelled.can_pay());
        assert!(OrderStatus::Paid.can_complete());
        assert!(!OrderStatus::Paying.can_complete());
        assert!(OrderStatus::Completed.is_paid());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
    }

    #[test]
    fn test_stored_names_parse_back() {
        for status in [
            OrderStatus::PendingPayment,
            OrderStatus::Paying,
            OrderStatus::Paid,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PreorderStatus::parse("PLACED"), Some(PreorderStatus::Placed));
        assert_eq!(PaymentStatus::parse("EXPIRED"), Some(PaymentStatus::Expired));
        assert_eq!(OrderStatus::parse("Draft"), None);
    }

    #[test]
    fn test_serialization_matches_stored_names() {
        let json = serde_json::to_string(&OrderStatus::PendingPayment).unwrap();
        assert_eq!(json, "\"PENDING_PAYMENT\"");
        let back: PaymentStatus = serde_json::from_str("\"SUCCEEDED\"").unwrap();
        assert_eq!(back, PaymentStatus::Succeeded);
    }
}
