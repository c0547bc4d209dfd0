//! Delayed-task queue for saga timeouts.
//!
//! Timers are scheduled when their resource is created and carry only the
//! ids needed to re-check state when they fire. There is no cancellation:
//! a timer whose target has already been resolved becomes a no-op.
//!
//! Taking a due task leases it rather than removing it. The worker completes
//! the task once handled or reschedules it after a failure; a task whose
//! worker died reappears when its lease runs out.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{OrderId, PaymentId, PreorderId};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

/// How long a taken task stays hidden from other takers by default.
const DEFAULT_LEASE_SECS: i64 = 60;

/// A timer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelayedTask {
    /// Cancel a preorder that was never placed.
    CancelPreorderIfUnpaid { preorder_id: PreorderId },
    /// Cancel an order that was never paid.
    CancelOrderIfUnpaid { order_id: OrderId },
    /// Expire a payment that was never confirmed.
    ExpirePayment { payment_id: PaymentId },
}

impl DelayedTask {
    /// Returns the task kind, for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DelayedTask::CancelPreorderIfUnpaid { .. } => "cancel_preorder_if_unpaid",
            DelayedTask::CancelOrderIfUnpaid { .. } => "cancel_order_if_unpaid",
            DelayedTask::ExpirePayment { .. } => "expire_payment",
        }
    }
}

/// A task with its due time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub task: DelayedTask,
    pub run_at: DateTime<Utc>,
    /// Earlier executions that failed.
    pub attempts: u32,
}

impl ScheduledTask {
    /// Creates a first execution of `task` at `run_at`.
    pub fn new(task: DelayedTask, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            run_at,
            attempts: 0,
        }
    }
}

/// Stores tasks until they are due. Delivery is at-least-once.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Schedules a task, replacing any task with the same id.
    async fn schedule(&self, task: ScheduledTask) -> Result<()>;

    /// Leases up to `limit` tasks due at `now`, earliest first.
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>>;

    /// Removes a handled task.
    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Returns the number of scheduled tasks, leased ones included.
    async fn len(&self) -> Result<usize>;
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    seq: u64,
    task: ScheduledTask,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .run_at
            .cmp(&other.task.run_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// In-memory delay queue ordered by due time, then by scheduling order.
#[derive(Clone)]
pub struct InMemoryDelayQueue {
    heap: Arc<Mutex<BinaryHeap<Reverse<Entry>>>>,
    seq: Arc<AtomicU64>,
    lease: Duration,
}

impl Default for InMemoryDelayQueue {
    fn default() -> Self {
        Self {
            heap: Arc::default(),
            seq: Arc::default(),
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }
}

impl InMemoryDelayQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long taken tasks stay hidden.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Returns every scheduled task, earliest first.
    pub async fn scheduled(&self) -> Vec<ScheduledTask> {
        let heap = self.heap.lock().await;
        let mut entries: Vec<&Entry> = heap.iter().map(|Reverse(e)| e).collect();
        entries.sort();
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    fn push(&self, heap: &mut BinaryHeap<Reverse<Entry>>, task: ScheduledTask) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(Reverse(Entry { seq, task }));
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    async fn schedule(&self, task: ScheduledTask) -> Result<()> {
        tracing::debug!(kind = task.task.kind(), run_at = %task.run_at, "Task scheduled");
        let mut heap = self.heap.lock().await;
        heap.retain(|Reverse(e)| e.task.id != task.id);
        self.push(&mut heap, task);
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>> {
        let mut heap = self.heap.lock().await;
        let mut due = Vec::new();
        while due.len() < limit {
            match heap.peek() {
                Some(Reverse(entry)) if entry.task.run_at <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry.task);
            }
        }
        for task in &due {
            let leased = ScheduledTask {
                run_at: now + self.lease,
                ..task.clone()
            };
            self.push(&mut heap, leased);
        }
        Ok(due)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.heap.lock().await.retain(|Reverse(e)| e.task.id != id);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.heap.lock().await.len())
    }
}

/// PostgreSQL-backed delay queue. Tasks survive restarts.
#[derive(Clone)]
pub struct PostgresDelayQueue {
    pool: PgPool,
    lease: Duration,
}

impl PostgresDelayQueue {
    /// Creates a queue on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    /// Sets how long taken tasks stay hidden.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn row_to_task(row: sqlx::postgres::PgRow) -> Result<ScheduledTask> {
        let attempts: i32 = row.try_get("attempts")?;
        Ok(ScheduledTask {
            id: row.try_get("id")?,
            task: serde_json::from_value(row.try_get("task")?)?,
            run_at: row.try_get("run_at")?,
            attempts: u32::try_from(attempts).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl DelayQueue for PostgresDelayQueue {
    #[tracing::instrument(skip(self, task), fields(kind = task.task.kind()))]
    async fn schedule(&self, task: ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delayed_tasks (id, kind, task, run_at, attempts)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET run_at = EXCLUDED.run_at, attempts = EXCLUDED.attempts
            "#,
        )
        .bind(task.id)
        .bind(task.task.kind())
        .bind(serde_json::to_value(task.task)?)
        .bind(task.run_at)
        .bind(i32::try_from(task.attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id, run_at
                FROM delayed_tasks
                WHERE run_at <= $1
                ORDER BY run_at, id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE delayed_tasks t
            SET run_at = $2
            FROM due
            WHERE t.id = due.id
            RETURNING t.id, t.task, due.run_at, t.attempts
            "#,
        )
        .bind(now)
        .bind(now + self.lease)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut due = rows
            .into_iter()
            .map(Self::row_to_task)
            .collect::<Result<Vec<_>>>()?;
        due.sort_by_key(|t| (t.run_at, t.id));
        Ok(due)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM delayed_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delayed_tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
