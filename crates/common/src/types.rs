use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates the identifier from its raw value.
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

numeric_id!(
    /// Product identifier. One stock row and one admission epoch exist per product (SKU).
    ProductId
);

numeric_id!(
    /// Identifier of a preorder, the idempotency key of the checkout half of the saga.
    PreorderId
);

numeric_id!(
    /// Identifier of a placed order.
    OrderId
);

numeric_id!(
    /// Identifier of a buyer.
    UserId
);

numeric_id!(
    /// Identifier of a merchant that scopes coupon templates.
    MerchantId
);

numeric_id!(
    /// Identifier of a coupon template (the published campaign).
    CouponTemplateId
);

numeric_id!(
    /// Identifier of a coupon instance claimed by one user.
    CouponId
);

numeric_id!(
    /// Identifier of a payment record.
    PaymentId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_preserves_raw_value() {
        let id = PreorderId::new(42);
        assert_eq!(id.get(), 42);
        assert_eq!(i64::from(id), 42);
        assert_eq!(PreorderId::from(42), id);
    }

    #[test]
    fn id_displays_raw_value() {
        assert_eq!(OrderId::new(100).to_string(), "100");
    }

    #[test]
    fn id_serializes_transparently() {
        let json = serde_json::to_string(&ProductId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: ProductId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProductId::new(7));
    }
}
