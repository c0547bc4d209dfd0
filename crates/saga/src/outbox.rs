//! Storage for half messages.
//!
//! A half message lives here from `prepare` until it is delivered, rolled
//! back or abandoned. The Postgres store keeps it across restarts so the
//! recovery sweep of a new process can still deliver it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::BusMessage;
use crate::error::Result;

/// A prepared message and when it was prepared.
#[derive(Debug, Clone, PartialEq)]
pub struct HalfMessage {
    pub message: BusMessage,
    pub prepared_at: DateTime<Utc>,
}

/// Holds half messages until they are delivered or discarded.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stores a prepared message.
    async fn hold(&self, half: &HalfMessage) -> Result<()>;

    /// Loads a held message.
    async fn get(&self, id: Uuid) -> Result<Option<HalfMessage>>;

    /// Removes a held message. Returns false if it was not held.
    async fn remove(&self, id: Uuid) -> Result<bool>;

    /// Records a failed delivery attempt.
    async fn record_attempt(&self, id: Uuid) -> Result<()>;

    /// Returns up to `limit` messages prepared at or before `cutoff`, oldest first.
    async fn prepared_before(&self, cutoff: DateTime<Utc>, limit: usize)
    -> Result<Vec<HalfMessage>>;

    /// Returns the number of held messages.
    async fn count(&self) -> Result<usize>;
}

/// In-memory outbox. Clones share the same messages.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    messages: Arc<Mutex<HashMap<Uuid, HalfMessage>>>,
}

impl InMemoryOutbox {
    /// Creates an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn hold(&self, half: &HalfMessage) -> Result<()> {
        self.messages
            .lock()
            .await
            .insert(half.message.id, half.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<HalfMessage>> {
        Ok(self.messages.lock().await.get(&id).cloned())
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        Ok(self.messages.lock().await.remove(&id).is_some())
    }

    async fn record_attempt(&self, id: Uuid) -> Result<()> {
        if let Some(half) = self.messages.lock().await.get_mut(&id) {
            half.message.attempts += 1;
        }
        Ok(())
    }

    async fn prepared_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HalfMessage>> {
        let messages = self.messages.lock().await;
        let mut due: Vec<HalfMessage> = messages
            .values()
            .filter(|h| h.prepared_at <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|h| (h.prepared_at, h.message.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.messages.lock().await.len())
    }
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Creates an outbox on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_half(row: sqlx::postgres::PgRow) -> Result<HalfMessage> {
        let attempts: i32 = row.try_get("attempts")?;
        Ok(HalfMessage {
            message: BusMessage {
                id: row.try_get("id")?,
                topic: row.try_get("topic")?,
                key: row.try_get("message_key")?,
                payload: row.try_get("payload")?,
                attempts: u32::try_from(attempts).unwrap_or_default(),
            },
            prepared_at: row.try_get("prepared_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn hold(&self, half: &HalfMessage) -> Result<()> {
        let message = &half.message;
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, topic, message_key, payload, attempts, prepared_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(i32::try_from(message.attempts).unwrap_or(i32::MAX))
        .bind(half.prepared_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<HalfMessage>> {
        sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, attempts, prepared_at
            FROM outbox_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(Self::row_to_half)
        .transpose()
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE outbox_messages SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prepared_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HalfMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, attempts, prepared_at
            FROM outbox_messages
            WHERE prepared_at <= $1
            ORDER BY prepared_at, id
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_half).collect()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CHECKOUT_TOPIC;
    use chrono::Duration;

    fn half(key: &str, prepared_at: DateTime<Utc>) -> HalfMessage {
        HalfMessage {
            message: BusMessage::new(CHECKOUT_TOPIC, key, &serde_json::json!({})).unwrap(),
            prepared_at,
        }
    }

    #[tokio::test]
    async fn test_prepared_before_is_oldest_first_and_limited() {
        let outbox = InMemoryOutbox::new();
        let now = Utc::now();
        outbox.hold(&half("new", now)).await.unwrap();
        outbox.hold(&half("old", now - Duration::minutes(2))).await.unwrap();
        outbox.hold(&half("mid", now - Duration::minutes(1))).await.unwrap();

        let due = outbox.prepared_before(now - Duration::seconds(30), 10).await.unwrap();
        let keys: Vec<_> = due.iter().map(|h| h.message.key.as_str()).collect();
        assert_eq!(keys, vec!["old", "mid"]);

        let due = outbox.prepared_before(now, 1).await.unwrap();
        assert_eq!(due[0].message.key, "old");
    }

    #[tokio::test]
    async fn test_clones_share_messages() {
        let outbox = InMemoryOutbox::new();
        let restarted = outbox.clone();
        let held = half("1", Utc::now());
        outbox.hold(&held).await.unwrap();

        restarted.record_attempt(held.message.id).await.unwrap();
        let loaded = restarted.get(held.message.id).await.unwrap().unwrap();
        assert_eq!(loaded.message.attempts, 1);
        assert!(restarted.remove(held.message.id).await.unwrap());
        assert_eq!(outbox.count().await.unwrap(), 0);
    }
}
