/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Event store access for the message bus.
//!
//! The external store is a plain Postgres holding five tables:
//! `messages` (latest state snapshot, upserted by `message_id`),
//! `message_events` (append-only lifecycle audit), `dlq_messages`
//! (terminal failures kept for replay), `idempotency_keys` (publish
//! dedup gate) and `poison_counters` (crash-loop quarantine). This crate
//! is the only component that talks to it; unique constraints on
//! `message_id` and `(org_id, dedup_key)` are the serialization points;
//! no application-level locks exist anywhere in the queue.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod pipeline;
mod redact;
mod writer;

pub use pipeline::*;
pub use redact::{RedactionLevel, Redactor};
pub use writer::{spawn_writer, AuditHandle};

use chrono::{DateTime, Utc};
use relayq_config::EventStoreConfig;
use relayq_protocol::{event, RequestMessage};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("event store error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

/// Row for the `messages` table capturing the latest message state.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub org_id: String,
    pub agent_id: Option<String>,
    pub message_type: Option<String>,
    pub priority: Option<i32>,
    pub status: String,
    pub payload: Value,
}

impl MessageRecord {
    /// Snapshot a request message at a given lifecycle status.
    #[must_use]
    pub fn from_message(msg: &RequestMessage, status: &str) -> Self {
        MessageRecord {
            message_id: msg.message_id.clone(),
            org_id: msg.org_id.clone(),
            agent_id: msg.agent_id.clone(),
            message_type: Some(msg.message_type.as_str().to_string()),
            priority: Some(i32::from(msg.priority.as_u8())),
            status: status.to_string(),
            payload: serde_json::to_value(msg).unwrap_or(Value::Null),
        }
    }
}

/// Row for the `message_events` table capturing lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEventRecord {
    pub message_id: Option<String>,
    pub org_id: String,
    pub event_type: String,
    pub details: Option<Value>,
}

/// Row for the `dlq_messages` table for terminal failures.
#[derive(Debug, Clone, Serialize)]
pub struct DlqRecord {
    pub org_id: String,
    pub original_message: Value,
    pub error_history: Value,
    pub can_replay: bool,
}

/// One unit of audit work flowing through the batched writer. Records are
/// applied in arrival order inside a single transaction per batch.
#[derive(Debug, Clone)]
pub enum AuditRecord {
    Message(MessageRecord),
    Event(MessageEventRecord),
    Dlq(DlqRecord),
}

impl AuditRecord {
    /// Terminal records must reach the store before the broker delivery is
    /// acked; the writer never drops them when degrading under store outages.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            AuditRecord::Event(e) => event::is_terminal(&e.event_type),
            AuditRecord::Dlq(_) => true,
            AuditRecord::Message(_) => false,
        }
    }
}

/// A replayable DLQ row as fetched for the admin tools.
#[derive(Debug, Clone)]
pub struct DlqRow {
    pub id: i64,
    pub original_message: Value,
    pub dlq_timestamp: DateTime<Utc>,
}

/// Filters for selecting DLQ rows to replay.
#[derive(Debug, Clone)]
pub struct DlqFilter {
    pub org_id: String,
    pub message_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// A message still sitting in QUEUED state, as seen by the promoter.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to the event store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the pool cannot be established.
    pub async fn connect(config: &EventStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await?;
        info!("event store pool connected");
        Ok(Store { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upsert the latest state snapshot for a message.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn upsert_message(&self, record: &MessageRecord) -> Result<(), StoreError> {
        apply_message(&self.pool, record).await?;
        Ok(())
    }

    /// Append one lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn insert_event(&self, record: &MessageEventRecord) -> Result<(), StoreError> {
        apply_event(&self.pool, record).await?;
        Ok(())
    }

    /// Insert a terminal failure for later analysis and replay.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn insert_dlq(&self, record: &DlqRecord) -> Result<(), StoreError> {
        apply_dlq(&self.pool, record).await?;
        Ok(())
    }

    /// Insert the publish dedup key. Returns `true` on first insert,
    /// `false` when the `(org_id, dedup_key)` pair was already present.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn try_insert_idempotency_key(
        &self,
        org_id: &str,
        dedup_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO idempotency_keys (org_id, dedup_key, created_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (org_id, dedup_key) DO NOTHING",
        )
        .bind(org_id)
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Best-effort rollback of an idempotency insert after a failed publish.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn remove_idempotency_key(
        &self,
        org_id: &str,
        dedup_key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE org_id = $1 AND dedup_key = $2")
            .bind(org_id)
            .bind(dedup_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Increment the crash counter for a dedup key and return the new count.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn poison_increment(&self, org_id: &str, dedup_key: &str) -> Result<i32, StoreError> {
        let row = sqlx::query(
            "INSERT INTO poison_counters (org_id, dedup_key, count, updated_at)
             VALUES ($1, $2, 1, NOW())
             ON CONFLICT (org_id, dedup_key)
             DO UPDATE SET count = poison_counters.count + 1, updated_at = NOW()
             RETURNING count",
        )
        .bind(org_id)
        .bind(dedup_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    /// Decrement the crash counter after a successful completion (floor 0).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn poison_decrement(&self, org_id: &str, dedup_key: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE poison_counters
             SET count = GREATEST(count - 1, 0), updated_at = NOW()
             WHERE org_id = $1 AND dedup_key = $2",
        )
        .bind(org_id)
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest persisted status for a message, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn message_status(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT status FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("status")))
    }

    /// QUEUED messages at a given priority older than `cutoff`, oldest
    /// first so promotion is stable inside a priority class.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn queued_older_than(
        &self,
        org_id: &str,
        priority: i32,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT message_id, payload, created_at
             FROM messages
             WHERE org_id = $1 AND status = 'QUEUED' AND priority = $2 AND created_at < $3
             ORDER BY created_at ASC
             LIMIT $4",
        )
        .bind(org_id)
        .bind(priority)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| QueuedMessage {
                message_id: r.get("message_id"),
                payload: r.get("payload"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Record the promoted priority on the snapshot row.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn set_message_priority(
        &self,
        message_id: &str,
        priority: i32,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE messages SET priority = $2, updated_at = NOW() WHERE message_id = $1")
            .bind(message_id)
            .bind(priority)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch replayable DLQ rows matching the filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn fetch_replayable(&self, filter: &DlqFilter) -> Result<Vec<DlqRow>, StoreError> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, original_message, dlq_timestamp
             FROM dlq_messages WHERE can_replay AND org_id = ",
        );
        builder.push_bind(&filter.org_id);
        if let Some(ref msg_type) = filter.message_type {
            builder.push(" AND original_message->>'type' = ");
            builder.push_bind(msg_type);
        }
        if let Some(since) = filter.since {
            builder.push(" AND dlq_timestamp >= ");
            builder.push_bind(since);
        }
        if let Some(until) = filter.until {
            builder.push(" AND dlq_timestamp <= ");
            builder.push_bind(until);
        }
        builder.push(" ORDER BY dlq_timestamp ASC LIMIT ");
        builder.push_bind(filter.limit);

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| DlqRow {
                id: r.get("id"),
                original_message: r.get("original_message"),
                dlq_timestamp: r.get("dlq_timestamp"),
            })
            .collect())
    }

    /// Delete DLQ rows older than `cutoff`, optionally scoped to one org.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn purge_dlq_older_than(
        &self,
        org_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = if let Some(org) = org_id {
            sqlx::query("DELETE FROM dlq_messages WHERE dlq_timestamp < $1 AND org_id = $2")
                .bind(cutoff)
                .bind(org)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("DELETE FROM dlq_messages WHERE dlq_timestamp < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected())
    }

    /// Delete idempotency keys older than `cutoff` so the table stays small.
    /// Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` on query failure.
    pub async fn purge_idempotency_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// Record application (shared between direct calls and batched writer)
// ---------------------------------------------------------------------------

pub(crate) async fn apply_message<'e, E>(executor: E, record: &MessageRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO messages (message_id, org_id, agent_id, type, priority, status, payload, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
         ON CONFLICT (message_id) DO UPDATE
         SET status = EXCLUDED.status,
             payload = EXCLUDED.payload,
             priority = EXCLUDED.priority,
             type = EXCLUDED.type,
             updated_at = NOW()",
    )
    .bind(&record.message_id)
    .bind(&record.org_id)
    .bind(&record.agent_id)
    .bind(&record.message_type)
    .bind(record.priority)
    .bind(&record.status)
    .bind(&record.payload)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn apply_event<'e, E>(
    executor: E,
    record: &MessageEventRecord,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO message_events (message_id, org_id, event_type, details, created_at)
         VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(&record.message_id)
    .bind(&record.org_id)
    .bind(&record.event_type)
    .bind(&record.details)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) async fn apply_dlq<'e, E>(executor: E, record: &DlqRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO dlq_messages (org_id, original_message, error_history, can_replay, dlq_timestamp)
         VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(&record.org_id)
    .bind(&record.original_message)
    .bind(&record.error_history)
    .bind(record.can_replay)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use relayq_protocol::{status, CreatedBy, CreatedByKind, MessageType, Priority};

    fn message() -> RequestMessage {
        let mut msg = RequestMessage {
            message_id: "m-1".to_string(),
            schema_version: relayq_protocol::SCHEMA_VERSION.to_string(),
            org_id: "acme".to_string(),
            agent_id: Some("agent-1".to_string()),
            user_id: None,
            goal_id: None,
            task_id: None,
            parent_message_id: None,
            created_by: CreatedBy {
                kind: CreatedByKind::System,
                id: "test".to_string(),
            },
            message_type: MessageType::ToolCall,
            priority: Priority::P1,
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            dedup_key: None,
            no_demote: false,
            context: None,
            resource_limits: None,
            payload: serde_json::json!({"tool": "search"}),
        };
        msg.stamp();
        msg
    }

    #[test]
    fn test_message_record_snapshot() {
        let record = MessageRecord::from_message(&message(), status::QUEUED);
        assert_eq!(record.message_id, "m-1");
        assert_eq!(record.org_id, "acme");
        assert_eq!(record.message_type.as_deref(), Some("tool_call"));
        assert_eq!(record.priority, Some(1));
        assert_eq!(record.status, "QUEUED");
        assert_eq!(record.payload["payload"]["tool"], "search");
    }

    #[test]
    fn test_terminal_records() {
        let completed = AuditRecord::Event(MessageEventRecord {
            message_id: Some("m-1".to_string()),
            org_id: "acme".to_string(),
            event_type: event::COMPLETED.to_string(),
            details: None,
        });
        let dequeued = AuditRecord::Event(MessageEventRecord {
            message_id: Some("m-1".to_string()),
            org_id: "acme".to_string(),
            event_type: event::DEQUEUED.to_string(),
            details: None,
        });
        let dlq = AuditRecord::Dlq(DlqRecord {
            org_id: "acme".to_string(),
            original_message: Value::Null,
            error_history: Value::Null,
            can_replay: true,
        });
        let snapshot = AuditRecord::Message(MessageRecord::from_message(
            &message(),
            status::COMPLETED,
        ));
        assert!(completed.is_terminal());
        assert!(dlq.is_terminal());
        assert!(!dequeued.is_terminal());
        assert!(!snapshot.is_terminal());
    }
}
