use async_trait::async_trait;
use common::ProductId;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{
    AuditEntry, AuditStatus, ConfirmPlan, LedgerOp, LedgerOutcome, StockLedger, StockRecord,
    UnfreezePlan, ensure_positive, plan_confirm, plan_refreeze, plan_unfreeze,
};
use crate::error::{InventoryError, Result};

/// PostgreSQL-backed stock ledger.
///
/// Every move runs in one transaction: the audit row is written or locked
/// first, then the bucket update is applied with its guard in the WHERE
/// clause. A guard failure returns an error, which rolls the transaction back.
#[derive(Clone)]
pub struct PostgresStockLedger {
    pool: PgPool,
}

impl PostgresStockLedger {
    /// Creates a new PostgreSQL stock ledger.
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

    fn row_to_record(row: PgRow) -> Result<StockRecord> {
        Ok(StockRecord {
            product_id: ProductId::new(row.try_get("product_id")?),
            stock: row.try_get("stock")?,
            frozen_stock: row.try_get("frozen_stock")?,
            sold: row.try_get("sold")?,
        })
    }

    fn row_to_audit(row: PgRow) -> Result<AuditEntry> {
        let status: String = row.try_get("status")?;
        Ok(AuditEntry {
            order_ref: row.try_get("order_ref")?,
            product_id: ProductId::new(row.try_get("product_id")?),
            quantity: row.try_get("quantity")?,
            status: AuditStatus::parse(&status)?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Applies one guarded bucket move inside `tx`.
    async fn apply(
        tx: &mut Transaction<'_, Postgres>,
        op: LedgerOp,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<()> {
        let sql = match op {
            LedgerOp::Freeze => {
                "UPDATE inventory SET stock = stock - $2, frozen_stock = frozen_stock + $2, updated_at = NOW() \
                 WHERE product_id = $1 AND stock >= $2"
            }
            LedgerOp::Unfreeze => {
                "UPDATE inventory SET frozen_stock = frozen_stock - $2, stock = stock + $2, updated_at = NOW() \
                 WHERE product_id = $1 AND frozen_stock >= $2"
            }
            LedgerOp::Confirm => {
                "UPDATE inventory SET frozen_stock = frozen_stock - $2, sold = sold + $2, updated_at = NOW() \
                 WHERE product_id = $1 AND frozen_stock >= $2"
            }
            LedgerOp::CancelSold => {
                "UPDATE inventory SET sold = sold - $2, stock = stock + $2, updated_at = NOW() \
                 WHERE product_id = $1 AND sold >= $2"
            }
        };

        let result = sqlx::query(sql)
            .bind(product_id.get())
            .bind(quantity)
            .execute(&mut **tx)
            .await?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM inventory WHERE product_id = $1)")
                    .bind(product_id.get())
                    .fetch_one(&mut **tx)
                    .await?;
            if !exists {
                return Err(InventoryError::InventoryNotFound(product_id));
            }
            return Err(InventoryError::NoRowsAffected {
                op,
                product_id,
                quantity,
            });
        }
        Ok(())
    }

    async fn lock_audit(
        tx: &mut Transaction<'_, Postgres>,
        order_ref: i64,
        product_id: ProductId,
    ) -> Result<Option<AuditEntry>> {
        let row = sqlx::query(
            r#"
            SELECT order_ref, product_id, quantity, status, updated_at
            FROM inventory_audit
            WHERE order_ref = $1 AND product_id = $2
            FOR UPDATE
            "#,
        )
        .bind(order_ref)
        .bind(product_id.get())
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Self::row_to_audit).transpose()
    }

    async fn set_audit_status(
        tx: &mut Transaction<'_, Postgres>,
        order_ref: i64,
        product_id: ProductId,
        status: AuditStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inventory_audit SET status = $3, updated_at = NOW()
            WHERE order_ref = $1 AND product_id = $2
            "#,
        )
        .bind(order_ref)
        .bind(product_id.get())
        .bind(status.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Inserts an audit row unless one exists. Returns true if inserted.
    async fn insert_audit(
        tx: &mut Transaction<'_, Postgres>,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
        status: AuditStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO inventory_audit (order_ref, product_id, quantity, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ON CONSTRAINT unique_audit_order_product DO NOTHING
            "#,
        )
        .bind(order_ref)
        .bind(product_id.get())
        .bind(quantity)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    async fn create(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        if stock < 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id,
                quantity: stock,
            });
        }
        sqlx::query("INSERT INTO inventory (product_id, stock) VALUES ($1, $2)")
            .bind(product_id.get())
            .bind(stock)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("inventory_pkey")
                {
                    return InventoryError::InventoryExists(product_id);
                }
                InventoryError::Database(e)
            })?;
        Ok(StockRecord::new(product_id, stock))
    }

    async fn get(&self, product_id: ProductId) -> Result<Option<StockRecord>> {
        let row = sqlx::query(
            "SELECT product_id, stock, frozen_stock, sold FROM inventory WHERE product_id = $1",
        )
        .bind(product_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn set_stock(&self, product_id: ProductId, stock: i64) -> Result<StockRecord> {
        if stock < 0 {
            return Err(InventoryError::InvalidQuantity {
                product_id,
                quantity: stock,
            });
        }
        let row = sqlx::query(
            r#"
            UPDATE inventory SET stock = $2, updated_at = NOW()
            WHERE product_id = $1
            RETURNING product_id, stock, frozen_stock, sold
            "#,
        )
        .bind(product_id.get())
        .bind(stock)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record)
            .transpose()?
            .ok_or(InventoryError::InventoryNotFound(product_id))
    }

    async fn delete(&self, product_id: ProductId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM inventory WHERE product_id = $1")
            .bind(product_id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn freeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut tx = self.pool.begin().await?;

        if !Self::insert_audit(&mut tx, order_ref, product_id, quantity, AuditStatus::Pending)
            .await?
        {
            let entry = Self::lock_audit(&mut tx, order_ref, product_id)
                .await?
                .ok_or_else(|| InventoryError::Corrupt(format!("audit {order_ref} vanished")))?;
            return plan_refreeze(&entry);
        }

        Self::apply(&mut tx, LedgerOp::Freeze, product_id, quantity).await?;
        tx.commit().await?;
        Ok(LedgerOutcome::Applied)
    }

    async fn unfreeze(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut tx = self.pool.begin().await?;

        // Tombstone first so a freeze that arrives later sees CANCELLED.
        if Self::insert_audit(&mut tx, order_ref, product_id, 0, AuditStatus::Cancelled).await? {
            tx.commit().await?;
            return Ok(LedgerOutcome::NoOp);
        }

        let entry = Self::lock_audit(&mut tx, order_ref, product_id)
            .await?
            .ok_or_else(|| InventoryError::Corrupt(format!("audit {order_ref} vanished")))?;

        match plan_unfreeze(&entry, quantity)? {
            UnfreezePlan::Skip => Ok(LedgerOutcome::NoOp),
            UnfreezePlan::Release(recorded) => {
                Self::apply(&mut tx, LedgerOp::Unfreeze, product_id, recorded).await?;
                Self::set_audit_status(&mut tx, order_ref, product_id, AuditStatus::Cancelled)
                    .await?;
                tx.commit().await?;
                Ok(LedgerOutcome::Applied)
            }
        }
    }

    async fn confirm(
        &self,
        order_ref: i64,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut tx = self.pool.begin().await?;

        let entry = Self::lock_audit(&mut tx, order_ref, product_id)
            .await?
            .ok_or(InventoryError::AuditNotFound {
                order_ref,
                product_id,
            })?;

        match plan_confirm(&entry, quantity)? {
            ConfirmPlan::Skip => Ok(LedgerOutcome::NoOp),
            ConfirmPlan::Commit(recorded) => {
                Self::apply(&mut tx, LedgerOp::Confirm, product_id, recorded).await?;
                Self::set_audit_status(&mut tx, order_ref, product_id, AuditStatus::Confirmed)
                    .await?;
                tx.commit().await?;
                Ok(LedgerOutcome::Applied)
            }
        }
    }

    async fn cancel_sold(&self, product_id: ProductId, quantity: i64) -> Result<LedgerOutcome> {
        ensure_positive(product_id, quantity)?;
        let mut tx = self.pool.begin().await?;
        Self::apply(&mut tx, LedgerOp::CancelSold, product_id, quantity).await?;
        tx.commit().await?;
        Ok(LedgerOutcome::Applied)
    }

    async fn audit_entry(
        &self,
        order_ref: i64,
        product_id: ProductId,
    ) -> Result<Option<AuditEntry>> {
        let row = sqlx::query(
            r#"
            SELECT order_ref, product_id, quantity, status, updated_at
            FROM inventory_audit
            WHERE order_ref = $1 AND product_id = $2
            "#,
        )
        .bind(order_ref)
        .bind(product_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_audit).transpose()
    }
}
