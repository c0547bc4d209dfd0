//! Coupon lock engine.
//!
//! Templates cap how many coupons are issued and how many one user may hold.
//! Each claimed coupon moves through UNUSED → LOCKED → USED, with LOCKED
//! always naming the preorder that holds it. Expiry is derived from the
//! template's validity window at read time and never written.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod service;
pub mod store;

pub use error::{CouponError, Result};
pub use memory::InMemoryCouponStore;
pub use model::{
    CouponInstance, CouponOutcome, CouponStatus, CouponTemplate, CouponView, DiscountQuote,
    DiscountRule, NewTemplate, ValidateCoupon,
};
pub use postgres::PostgresCouponStore;
pub use service::CouponService;
pub use store::CouponStore;
