//! pgmq feed plumbing via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive.

use crate::error::Result;
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    pub message: serde_json::Value,
}

fn count(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent). Installs the extension if needed.
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
            .execute(&self.pool)
            .await?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        count(queue_name, "create");
        Ok(())
    }

    /// Enqueue an upstream item. Returns the message ID.
    pub async fn send_to_queue(&self, queue_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        count(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, hiding them for `vt_seconds`. Unarchived
    /// messages reappear once the visibility timeout lapses.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<_, (i64, i32, DateTime<Utc>, serde_json::Value)>(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)",
        )
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(&self.pool)
        .await?;

        count(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to the archive table, preserved for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        count(queue_name, "archive");
        Ok(())
    }
}
