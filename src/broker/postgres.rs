//! PostgreSQL-backed message queue.
//!
//! Messages live in a `queue_messages` table and are claimed with
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never contend on the
//! same row. Claiming stamps `leased_until` and bumps `delivery_count` in
//! the same transaction; an expired lease makes the row deliverable again
//! without any reaper process.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;

use crate::broker::{Delivery, MessageQueue, QueueError};
use crate::models::QueueEnvelope;

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl MessageQueue for PgQueue {
    async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<i64, QueueError> {
        let payload = serde_json::to_value(envelope)?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO queue_messages (envelope) VALUES ($1) RETURNING id",
        )
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn pull(&self, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, serde_json::Value, i32)> = sqlx::query_as(
            r#"SELECT id, envelope, delivery_count FROM queue_messages
               WHERE available_at <= NOW()
                 AND (leased_until IS NULL OR leased_until < NOW())
               ORDER BY id ASC
               LIMIT 1
               FOR UPDATE SKIP LOCKED"#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, envelope, delivery_count)) = row else {
            return Ok(None);
        };

        let leased_until = Utc::now() + lease;
        sqlx::query(
            "UPDATE queue_messages SET leased_until = $2, delivery_count = delivery_count + 1 WHERE id = $1",
        )
        .bind(id)
        .bind(leased_until)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(Delivery {
            id,
            envelope: serde_json::from_value(envelope)?,
            delivery_count: delivery_count + 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let available_at = Utc::now() + delay;
        sqlx::query(
            "UPDATE queue_messages SET leased_until = NULL, available_at = $2 WHERE id = $1",
        )
        .bind(delivery.id)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, QueueError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
