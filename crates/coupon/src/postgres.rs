use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, CouponTemplateId, MerchantId, Money, OrderId, PreorderId, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::error::{CouponError, Result};
use crate::model::{
    CouponInstance, CouponOutcome, CouponStatus, CouponTemplate, DiscountRule, NewTemplate,
};
use crate::store::CouponStore;

const TEMPLATE_COLUMNS: &str = "id, merchant_id, name, kind, amount_off_cents, percent_off, \
     max_discount_cents, min_spend_cents, total_quantity, issued_quantity, per_user_limit, \
     valid_from, valid_until";

const COUPON_COLUMNS: &str =
    "id, template_id, user_id, status, locked_preorder, used_order_id, claimed_at, updated_at";

/// PostgreSQL-backed coupon store.
#[derive(Clone)]
pub struct PostgresCouponStore {
    pool: PgPool,
}

impl PostgresCouponStore {
    /// Creates a new PostgreSQL coupon store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_template(row: PgRow) -> Result<CouponTemplate> {
        let kind: String = row.try_get("kind")?;
        let rule = match kind.as_str() {
            "FIXED_AMOUNT" => DiscountRule::FixedAmount {
                amount_off: Money::from_cents(row.try_get("amount_off_cents")?),
            },
            "PERCENTAGE" => {
                let cap: i64 = row.try_get("max_discount_cents")?;
                DiscountRule::Percentage {
                    percent_off: row.try_get("percent_off")?,
                    max_discount: (cap > 0).then(|| Money::from_cents(cap)),
                }
            }
            other => return Err(CouponError::Corrupt(format!("coupon kind {other}"))),
        };

        Ok(CouponTemplate {
            id: CouponTemplateId::new(row.try_get("id")?),
            merchant_id: row
                .try_get::<Option<i64>, _>("merchant_id")?
                .map(MerchantId::new),
            name: row.try_get("name")?,
            rule,
            min_spend: Money::from_cents(row.try_get("min_spend_cents")?),
            total_quantity: row.try_get("total_quantity")?,
            issued_quantity: row.try_get("issued_quantity")?,
            per_user_limit: row.try_get("per_user_limit")?,
            valid_from: row.try_get("valid_from")?,
            valid_until: row.try_get("valid_until")?,
        })
    }

    fn row_to_coupon(row: PgRow) -> Result<CouponInstance> {
        let status: String = row.try_get("status")?;
        Ok(CouponInstance {
            id: CouponId::new(row.try_get("id")?),
            template_id: CouponTemplateId::new(row.try_get("template_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            status: CouponStatus::parse(&status)?,
            locked_preorder: row
                .try_get::<Option<i64>, _>("locked_preorder")?
                .map(PreorderId::new),
            used_order_id: row
                .try_get::<Option<i64>, _>("used_order_id")?
                .map(OrderId::new),
            claimed_at: row.try_get("claimed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_template(
        tx: &mut Transaction<'_, Postgres>,
        template_id: CouponTemplateId,
        for_update: bool,
    ) -> Result<Option<CouponTemplate>> {
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE id = $1{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(template_id.get())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Self::row_to_template).transpose()
    }

    /// Reads the coupon and its template, holding a row lock on the coupon.
    async fn lock_coupon_row(
        tx: &mut Transaction<'_, Postgres>,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<(CouponInstance, CouponTemplate)> {
        let sql = format!(
            "SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1 AND user_id = $2 FOR UPDATE"
        );
        let coupon = sqlx::query(&sql)
            .bind(coupon_id.get())
            .bind(user_id.get())
            .fetch_optional(&mut **tx)
            .await?
            .map(Self::row_to_coupon)
            .transpose()?
            .ok_or(CouponError::CouponNotFound { coupon_id, user_id })?;

        let template = Self::fetch_template(tx, coupon.template_id, false)
            .await?
            .ok_or_else(|| {
                CouponError::Corrupt(format!("template {} missing", coupon.template_id))
            })?;
        Ok((coupon, template))
    }
}

#[async_trait]
impl CouponStore for PostgresCouponStore {
    async fn insert_template(&self, template: NewTemplate) -> Result<CouponTemplate> {
        let (amount_off, percent_off, max_discount) = match template.rule {
            DiscountRule::FixedAmount { amount_off } => (amount_off.cents(), 0, 0),
            DiscountRule::Percentage {
                percent_off,
                max_discount,
            } => (0, percent_off, max_discount.map_or(0, |m| m.cents())),
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO coupon_templates (merchant_id, name, kind, amount_off_cents, percent_off,
                max_discount_cents, min_spend_cents, total_quantity, per_user_limit, valid_from, valid_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(template.merchant_id.map(|m| m.get()))
        .bind(&template.name)
        .bind(template.rule.kind())
        .bind(amount_off)
        .bind(percent_off)
        .bind(max_discount)
        .bind(template.min_spend.cents())
        .bind(template.total_quantity)
        .bind(template.per_user_limit)
        .bind(template.valid_from)
        .bind(template.valid_until)
        .fetch_one(&self.pool)
        .await?;

        Ok(CouponTemplate::from_new(CouponTemplateId::new(id), template))
    }

    async fn template(&self, template_id: CouponTemplateId) -> Result<Option<CouponTemplate>> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(template_id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_template).transpose()
    }

    async fn claim(
        &self,
        template_id: CouponTemplateId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<CouponInstance> {
        let mut tx = self.pool.begin().await?;

        // The template row lock serializes claims of one template, so the
        // per-user count below cannot race another claim by the same user.
        let template = Self::fetch_template(&mut tx, template_id, true)
            .await?
            .ok_or(CouponError::TemplateNotFound(template_id))?;
        template.check_window(now)?;

        if template.per_user_limit > 0 {
            let held: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM coupons WHERE template_id = $1 AND user_id = $2",
            )
            .bind(template_id.get())
            .bind(user_id.get())
            .fetch_one(&mut *tx)
            .await?;
            template.check_user_limit(user_id, held)?;
        }

        let issued = sqlx::query(
            r#"
            UPDATE coupon_templates SET issued_quantity = issued_quantity + 1
            WHERE id = $1 AND (total_quantity = 0 OR issued_quantity < total_quantity)
            "#,
        )
        .bind(template_id.get())
        .execute(&mut *tx)
        .await?;
        if issued.rows_affected() == 0 {
            return Err(CouponError::SoldOut(template_id));
        }

        let sql = format!(
            "INSERT INTO coupons (template_id, user_id, status, claimed_at, updated_at) \
             VALUES ($1, $2, 'UNUSED', $3, $3) RETURNING {COUPON_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(template_id.get())
            .bind(user_id.get())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let coupon = Self::row_to_coupon(row)?;

        tx.commit().await?;
        Ok(coupon)
    }

    async fn coupon(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<Option<(CouponInstance, CouponTemplate)>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE id = $1 AND user_id = $2");
        let Some(coupon) = sqlx::query(&sql)
            .bind(coupon_id.get())
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_coupon)
            .transpose()?
        else {
            return Ok(None);
        };

        let template = self.template(coupon.template_id).await?.ok_or_else(|| {
            CouponError::Corrupt(format!("template {} missing", coupon.template_id))
        })?;
        Ok(Some((coupon, template)))
    }

    async fn lock(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        now: DateTime<Utc>,
    ) -> Result<CouponOutcome> {
        let mut tx = self.pool.begin().await?;
        let (coupon, template) = Self::lock_coupon_row(&mut tx, coupon_id, user_id).await?;

        let outcome = coupon.plan_lock(&template, preorder_id, now)?;
        if outcome.is_applied() {
            let result = sqlx::query(
                r#"
                UPDATE coupons SET status = 'LOCKED', locked_preorder = $3, updated_at = NOW()
                WHERE id = $1 AND user_id = $2 AND status = 'UNUSED' AND locked_preorder IS NULL
                "#,
            )
            .bind(coupon_id.get())
            .bind(user_id.get())
            .bind(preorder_id.get())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CouponError::Conflict {
                    coupon_id,
                    op: "lock",
                });
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn release(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
    ) -> Result<CouponOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE coupons SET status = 'UNUSED', locked_preorder = NULL, updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'LOCKED' AND locked_preorder = $3
            "#,
        )
        .bind(coupon_id.get())
        .bind(user_id.get())
        .bind(preorder_id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(CouponOutcome::Applied);
        }

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM coupons WHERE id = $1 AND user_id = $2)",
        )
        .bind(coupon_id.get())
        .bind(user_id.get())
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Err(CouponError::CouponNotFound { coupon_id, user_id });
        }
        Ok(CouponOutcome::NoOp)
    }

    async fn redeem(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        preorder_id: PreorderId,
        order_id: OrderId,
    ) -> Result<CouponOutcome> {
        let mut tx = self.pool.begin().await?;
        let (coupon, _) = Self::lock_coupon_row(&mut tx, coupon_id, user_id).await?;

        let outcome = coupon.plan_redeem(preorder_id, order_id)?;
        if outcome.is_applied() {
            let result = sqlx::query(
                r#"
                UPDATE coupons SET status = 'USED', used_order_id = $4, updated_at = NOW()
                WHERE id = $1 AND user_id = $2 AND status = 'LOCKED' AND locked_preorder = $3
                "#,
            )
            .bind(coupon_id.get())
            .bind(user_id.get())
            .bind(preorder_id.get())
            .bind(order_id.get())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(CouponError::Conflict {
                    coupon_id,
                    op: "redeem",
                });
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(CouponInstance, CouponTemplate)>> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE user_id = $1 ORDER BY id");
        let coupons = sqlx::query(&sql)
            .bind(user_id.get())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Self::row_to_coupon)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<i64> = coupons.iter().map(|c| c.template_id.get()).collect();
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM coupon_templates WHERE id = ANY($1)");
        let templates = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Self::row_to_template)
            .collect::<Result<Vec<_>>>()?;

        coupons
            .into_iter()
            .map(|coupon| {
                let template = templates
                    .iter()
                    .find(|t| t.id == coupon.template_id)
                    .cloned()
                    .ok_or_else(|| {
                        CouponError::Corrupt(format!("template {} missing", coupon.template_id))
                    })?;
                Ok((coupon, template))
            })
            .collect()
    }
}
