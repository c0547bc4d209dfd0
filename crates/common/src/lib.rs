//! Shared types for the fulfillment services.

pub mod clock;
pub mod id_gen;
pub mod money;
pub mod status;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id_gen::IdGenerator;
pub use money::Money;
pub use status::{HasStatus, Status, StatusCode};
pub use types::{
    CouponId, CouponTemplateId, MerchantId, OrderId, PaymentId, PreorderId, ProductId, UserId,
};
