//! Coupon service scenarios against the in-memory store.

use std::sync::Arc;

use chrono::Duration;
use common::{
    Clock, CouponId, ManualClock, MerchantId, Money, OrderId, PreorderId, UserId,
};
use coupon::{
    CouponError, CouponOutcome, CouponService, CouponStatus, CouponTemplate, DiscountRule,
    InMemoryCouponStore, NewTemplate, ValidateCoupon,
};
use futures_util::future::join_all;

struct Fixture {
    service: Arc<CouponService>,
    clock: ManualClock,
}

fn fixture() -> Fixture {
    let clock = ManualClock::starting_now();
    let service = CouponService::new(
        Arc::new(InMemoryCouponStore::new()),
        Arc::new(clock.clone()),
    );
    Fixture {
        service: Arc::new(service),
        clock,
    }
}

fn template(clock: &ManualClock, total: i64, per_user: i64) -> NewTemplate {
    let now = clock.now();
    NewTemplate {
        merchant_id: Some(MerchantId::new(1)),
        name: "welcome".into(),
        rule: DiscountRule::FixedAmount {
            amount_off: Money::from_cents(500),
        },
        min_spend: Money::from_cents(1_000),
        total_quantity: total,
        per_user_limit: per_user,
        valid_from: now - Duration::hours(1),
        valid_until: now + Duration::days(7),
    }
}

async fn published(f: &Fixture, total: i64, per_user: i64) -> CouponTemplate {
    f.service
        .publish_coupon(template(&f.clock, total, per_user))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_respect_total_quantity() {
    let f = fixture();
    let t = published(&f, 5, 0).await;

    let claims = (1..=20).map(|n| {
        let service = Arc::clone(&f.service);
        tokio::spawn(async move { service.claim_coupon(t.id, UserId::new(n)).await })
    });
    let results: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    assert!(
        results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(CouponError::SoldOut(_))))
    );
}

#[tokio::test]
async fn per_user_limit_is_enforced() {
    let f = fixture();
    let t = published(&f, 0, 2).await;
    let user = UserId::new(1);

    f.service.claim_coupon(t.id, user).await.unwrap();
    f.service.claim_coupon(t.id, user).await.unwrap();
    assert!(matches!(
        f.service.claim_coupon(t.id, user).await,
        Err(CouponError::LimitExceeded { limit: 2, .. })
    ));
    f.service.claim_coupon(t.id, UserId::new(2)).await.unwrap();
}

#[tokio::test]
async fn claim_outside_window_is_rejected() {
    let f = fixture();
    let t = published(&f, 0, 0).await;
    f.clock.advance(Duration::days(8));
    assert!(matches!(
        f.service.claim_coupon(t.id, UserId::new(1)).await,
        Err(CouponError::Expired(_))
    ));
}

#[tokio::test]
async fn lock_release_redeem_lifecycle() {
    let f = fixture();
    let t = published(&f, 0, 0).await;
    let user = UserId::new(1);
    let c = f.service.claim_coupon(t.id, user).await.unwrap();
    let preorder = PreorderId::new(11);

    assert_eq!(
        f.service.lock_coupon(c.id, user, preorder).await.unwrap(),
        CouponOutcome::Applied
    );
    assert_eq!(
        f.service.lock_coupon(c.id, user, preorder).await.unwrap(),
        CouponOutcome::NoOp
    );
    assert!(matches!(
        f.service.lock_coupon(c.id, user, PreorderId::new(12)).await,
        Err(CouponError::LockedByOther { .. })
    ));

    assert!(
        f.service
            .release_coupon(c.id, user, preorder)
            .await
            .unwrap()
            .is_applied()
    );
    assert!(
        !f.service
            .release_coupon(c.id, user, preorder)
            .await
            .unwrap()
            .is_applied()
    );

    let second = PreorderId::new(13);
    let order = OrderId::new(130);
    f.service.lock_coupon(c.id, user, second).await.unwrap();
    // A stale release by the earlier preorder must not free the new lock.
    assert!(
        !f.service
            .release_coupon(c.id, user, preorder)
            .await
            .unwrap()
            .is_applied()
    );
    assert_eq!(
        f.service.redeem_coupon(c.id, user, second, order).await.unwrap(),
        CouponOutcome::Applied
    );
    assert_eq!(
        f.service.redeem_coupon(c.id, user, second, order).await.unwrap(),
        CouponOutcome::NoOp
    );

    let views = f.service.list_user_coupons(user).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].effective_status, CouponStatus::Used);
    assert_eq!(views[0].coupon.used_order_id, Some(order));
}

#[tokio::test]
async fn validate_quotes_discount() {
    let f = fixture();
    let t = published(&f, 0, 0).await;
    let user = UserId::new(1);
    let c = f.service.claim_coupon(t.id, user).await.unwrap();

    let request = ValidateCoupon {
        coupon_id: c.id,
        user_id: user,
        merchant_id: MerchantId::new(1),
        amount: Money::from_cents(2_500),
        preorder_id: None,
    };
    let q = f.service.validate_coupon(request).await.unwrap();
    assert_eq!(q.discount, Money::from_cents(500));
    assert_eq!(q.payable, Money::from_cents(2_000));

    let wrong_merchant = ValidateCoupon {
        merchant_id: MerchantId::new(2),
        ..request
    };
    assert!(matches!(
        f.service.validate_coupon(wrong_merchant).await,
        Err(CouponError::MerchantMismatch { .. })
    ));

    let missing = ValidateCoupon {
        coupon_id: CouponId::new(999),
        ..request
    };
    assert!(matches!(
        f.service.validate_coupon(missing).await,
        Err(CouponError::CouponNotFound { .. })
    ));
}

#[tokio::test]
async fn unused_coupons_expire_lazily() {
    let f = fixture();
    let t = published(&f, 0, 0).await;
    let user = UserId::new(1);
    let c = f.service.claim_coupon(t.id, user).await.unwrap();

    f.clock.advance(Duration::days(8));
    let views = f.service.list_user_coupons(user).await.unwrap();
    assert_eq!(views[0].effective_status, CouponStatus::Expired);
    assert_eq!(views[0].coupon.status, CouponStatus::Unused);

    assert!(matches!(
        f.service.lock_coupon(c.id, user, PreorderId::new(1)).await,
        Err(CouponError::Expired(_))
    ));
}

#[tokio::test]
async fn publish_rejects_bad_templates() {
    let f = fixture();
    let mut bad = template(&f.clock, 0, 0);
    bad.rule = DiscountRule::Percentage {
        percent_off: 150,
        max_discount: None,
    };
    assert!(matches!(
        f.service.publish_coupon(bad).await,
        Err(CouponError::InvalidTemplate(_))
    ));
}
