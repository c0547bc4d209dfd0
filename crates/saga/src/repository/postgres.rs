use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, MerchantId, Money, OrderId, PaymentId, PreorderId, ProductId, UserId};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{OrderRepository, check_placeable};
use crate::error::{Result, SagaError};
use crate::model::{
    Order, OrderItem, OrderQuery, Payment, PlaceOutcome, Preorder, PreorderItem,
};
use crate::state::{OrderStatus, PaymentStatus, PreorderStatus};

const PREORDER_COLUMNS: &str = "id, user_id, product_id, merchant_id, quantity, unit_price_cents, \
     coupon_id, original_cents, discount_cents, final_cents, status, snapshot, cancel_reason, \
     expire_at, created_at";

const ORDER_COLUMNS: &str = "id, preorder_id, user_id, product_id, quantity, coupon_id, \
     original_cents, discount_cents, final_cents, status, cancel_reason, expire_time, paid_at, \
     created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, order_id, amount_cents, status, expire_at, created_at, updated_at";

/// PostgreSQL-backed order repository.
#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    /// Creates a new PostgreSQL order repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_preorder(row: PgRow) -> Result<Preorder> {
        let status: String = row.try_get("status")?;
        Ok(Preorder {
            id: PreorderId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            merchant_id: row
                .try_get::<Option<i64>, _>("merchant_id")?
                .map(MerchantId::new),
            quantity: row.try_get("quantity")?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            coupon_id: row
                .try_get::<Option<i64>, _>("coupon_id")?
                .map(CouponId::new),
            original: Money::from_cents(row.try_get("original_cents")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            payable: Money::from_cents(row.try_get("final_cents")?),
            status: PreorderStatus::parse(&status)
                .ok_or_else(|| SagaError::Corrupt(format!("preorder status {status}")))?,
            snapshot: row.try_get("snapshot")?,
            cancel_reason: row.try_get("cancel_reason")?,
            expire_at: row.try_get("expire_at")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_preorder_item(row: PgRow) -> Result<PreorderItem> {
        Ok(PreorderItem {
            preorder_id: PreorderId::new(row.try_get("preorder_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get("quantity")?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status: String = row.try_get("status")?;
        Ok(Order {
            id: OrderId::new(row.try_get("id")?),
            preorder_id: PreorderId::new(row.try_get("preorder_id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get("quantity")?,
            coupon_id: row
                .try_get::<Option<i64>, _>("coupon_id")?
                .map(CouponId::new),
            original: Money::from_cents(row.try_get("original_cents")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            payable: Money::from_cents(row.try_get("final_cents")?),
            status: OrderStatus::parse(&status)
                .ok_or_else(|| SagaError::Corrupt(format!("order status {status}")))?,
            cancel_reason: row.try_get("cancel_reason")?,
            expire_time: row.try_get("expire_time")?,
            paid_at: row.try_get("paid_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_order_item(row: PgRow) -> Result<OrderItem> {
        Ok(OrderItem {
            order_id: OrderId::new(row.try_get("order_id")?),
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get("quantity")?,
            unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            snapshot: row.try_get("snapshot")?,
        })
    }

    fn row_to_payment(row: PgRow) -> Result<Payment> {
        let status: String = row.try_get("status")?;
        Ok(Payment {
            id: PaymentId::new(row.try_get("id")?),
            order_id: OrderId::new(row.try_get("order_id")?),
            amount: Money::from_cents(row.try_get("amount_cents")?),
            status: PaymentStatus::parse(&status)
                .ok_or_else(|| SagaError::Corrupt(format!("payment status {status}")))?,
            expire_at: row.try_get("expire_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_order_by_preorder(
        tx: &mut Transaction<'_, Postgres>,
        preorder_id: PreorderId,
    ) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE preorder_id = $1");
        sqlx::query(&sql)
            .bind(preorder_id.get())
            .fetch_optional(&mut **tx)
            .await?
            .map(Self::row_to_order)
            .transpose()
    }
}

fn names<T: Copy>(states: &[T], name: fn(&T) -> &'static str) -> Vec<String> {
    states.iter().map(|s| name(s).to_string()).collect()
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn insert_preorder(&self, preorder: &Preorder) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO preorders (id, user_id, product_id, merchant_id, quantity, unit_price_cents,
                                   coupon_id, original_cents, discount_cents, final_cents, status,
                                   snapshot, cancel_reason, expire_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(preorder.id.get())
        .bind(preorder.user_id.get())
        .bind(preorder.product_id.get())
        .bind(preorder.merchant_id.map(|m| m.get()))
        .bind(preorder.quantity)
        .bind(preorder.unit_price.cents())
        .bind(preorder.coupon_id.map(|c| c.get()))
        .bind(preorder.original.cents())
        .bind(preorder.discount.cents())
        .bind(preorder.payable.cents())
        .bind(preorder.status.as_str())
        .bind(&preorder.snapshot)
        .bind(&preorder.cancel_reason)
        .bind(preorder.expire_at)
        .bind(preorder.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn preorder(&self, preorder_id: PreorderId) -> Result<Option<Preorder>> {
        let sql = format!("SELECT {PREORDER_COLUMNS} FROM preorders WHERE id = $1");
        sqlx::query(&sql)
            .bind(preorder_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_preorder)
            .transpose()
    }

    async fn delete_pending_preorder(&self, preorder_id: PreorderId) -> Result<bool> {
        // Items go with the row through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM preorders WHERE id = $1 AND status = 'PENDING'")
            .bind(preorder_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_preorder_item(&self, item: &PreorderItem) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO preorder_items (preorder_id, product_id, quantity, unit_price_cents, snapshot)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (preorder_id, product_id) DO NOTHING
            "#,
        )
        .bind(item.preorder_id.get())
        .bind(item.product_id.get())
        .bind(item.quantity)
        .bind(item.unit_price.cents())
        .bind(&item.snapshot)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) => {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_foreign_key_violation()
                {
                    return Err(SagaError::PreorderNotFound(item.preorder_id));
                }
                Err(e.into())
            }
        }
    }

    async fn preorder_items(&self, preorder_id: PreorderId) -> Result<Vec<PreorderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT preorder_id, product_id, quantity, unit_price_cents, snapshot
            FROM preorder_items
            WHERE preorder_id = $1
            ORDER BY product_id
            "#,
        )
        .bind(preorder_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_preorder_item).collect()
    }

    async fn transition_preorder(
        &self,
        preorder_id: PreorderId,
        from: &[PreorderStatus],
        to: PreorderStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE preorders
            SET status = $3, cancel_reason = COALESCE($4, cancel_reason)
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(preorder_id.get())
        .bind(names(from, PreorderStatus::as_str))
        .bind(to.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn place_order(
        &self,
        preorder_id: PreorderId,
        order_id: OrderId,
        expire_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PlaceOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(order) = Self::fetch_order_by_preorder(&mut tx, preorder_id).await? {
            return Ok(PlaceOutcome::Existing(order));
        }

        let sql = format!("SELECT {PREORDER_COLUMNS} FROM preorders WHERE id = $1");
        let preorder = sqlx::query(&sql)
            .bind(preorder_id.get())
            .fetch_optional(&mut *tx)
            .await?
            .map(Self::row_to_preorder)
            .transpose()?
            .ok_or(SagaError::PreorderNotFound(preorder_id))?;
        let has_items: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM preorder_items WHERE preorder_id = $1)",
        )
        .bind(preorder_id.get())
        .fetch_one(&mut *tx)
        .await?;

        if let Err(e) = check_placeable(&preorder, has_items, now) {
            // A concurrent placement may have committed after the first lookup.
            if preorder.status == PreorderStatus::Placed
                && let Some(order) = Self::fetch_order_by_preorder(&mut tx, preorder_id).await?
            {
                return Ok(PlaceOutcome::Existing(order));
            }
            return Err(e);
        }

        let promoted = sqlx::query(
            r#"
            UPDATE preorders SET status = 'PLACED'
            WHERE id = $1 AND status = 'PENDING' AND expire_at > $2
            "#,
        )
        .bind(preorder_id.get())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() == 0 {
            if let Some(order) = Self::fetch_order_by_preorder(&mut tx, preorder_id).await? {
                return Ok(PlaceOutcome::Existing(order));
            }
            return Err(SagaError::PreorderExpired(preorder_id));
        }

        let order = Order::from_preorder(order_id, &preorder, expire_time, now);
        sqlx::query(
            r#"
            INSERT INTO orders (id, preorder_id, user_id, product_id, quantity, coupon_id,
                                original_cents, discount_cents, final_cents, status, expire_time,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            "#,
        )
        .bind(order.id.get())
        .bind(order.preorder_id.get())
        .bind(order.user_id.get())
        .bind(order.product_id.get())
        .bind(order.quantity)
        .bind(order.coupon_id.map(|c| c.get()))
        .bind(order.original.cents())
        .bind(order.discount.cents())
        .bind(order.payable.cents())
        .bind(order.status.as_str())
        .bind(order.expire_time)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO order_items (order_id, product_id, quantity, unit_price_cents, snapshot)
            SELECT $1, product_id, quantity, unit_price_cents, snapshot
            FROM preorder_items
            WHERE preorder_id = $2
            "#,
        )
        .bind(order.id.get())
        .bind(preorder_id.get())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PlaceOutcome::Created(order))
    }

    async fn order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        sqlx::query(&sql)
            .bind(order_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_order)
            .transpose()
    }

    async fn order_by_preorder(&self, preorder_id: PreorderId) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE preorder_id = $1");
        sqlx::query(&sql)
            .bind(preorder_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_order)
            .transpose()
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, quantity, unit_price_cents, snapshot
            FROM order_items
            WHERE order_id = $1
            ORDER BY product_id
            "#,
        )
        .bind(order_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_order_item).collect()
    }

    async fn list_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query(&sql)
            .bind(query.user_id.get())
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.limit.max(0))
            .bind(query.offset.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_order).collect()
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                cancel_reason = COALESCE($4, cancel_reason),
                paid_at = CASE WHEN $3 = 'PAID' THEN $5 ELSE paid_at END,
                updated_at = $5
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(order_id.get())
        .bind(names(from, OrderStatus::as_str))
        .bind(to.as_str())
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(Payment, bool)> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, amount_cents, status, expire_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT ON CONSTRAINT unique_payment_order DO NOTHING
            "#,
        )
        .bind(payment.id.get())
        .bind(payment.order_id.get())
        .bind(payment.amount.cents())
        .bind(payment.status.as_str())
        .bind(payment.expire_at)
        .bind(payment.created_at)
        .execute(&mut *tx)
        .await?;

        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1");
        let stored = sqlx::query(&sql)
            .bind(payment.order_id.get())
            .fetch_one(&mut *tx)
            .await
            .map_err(SagaError::from)
            .and_then(Self::row_to_payment)?;
        tx.commit().await?;
        Ok((stored, inserted.rows_affected() == 1))
    }

    async fn payment(&self, payment_id: PaymentId) -> Result<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query(&sql)
            .bind(payment_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_payment)
            .transpose()
    }

    async fn payment_for_order(&self, order_id: OrderId) -> Result<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1");
        sqlx::query(&sql)
            .bind(order_id.get())
            .fetch_optional(&self.pool)
            .await?
            .map(Self::row_to_payment)
            .transpose()
    }

    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        from: &[PaymentStatus],
        to: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE payments SET status = $3, updated_at = $4 WHERE id = $1 AND status = ANY($2)",
        )
        .bind(payment_id.get())
        .bind(names(from, PaymentStatus::as_str))
        .bind(to.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expired_preorders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PreorderId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM preorders
            WHERE status = 'PENDING' AND expire_at <= $1
            ORDER BY expire_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(PreorderId::new).collect())
    }

    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM orders
            WHERE status = ANY($1) AND expire_time <= $2
            ORDER BY expire_time, id
            LIMIT $3
            "#,
        )
        .bind(names(OrderStatus::CANCELLABLE, OrderStatus::as_str))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(OrderId::new).collect())
    }
}
