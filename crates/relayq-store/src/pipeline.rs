/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! High-level audit helpers for common lifecycle transitions.
//!
//! Each helper emits the snapshot upsert and the lifecycle events for one
//! transition so producers and workers stay free of record plumbing.

use serde_json::{json, Value};

use relayq_protocol::{event, status, ErrorKind, Priority, RequestMessage, RetryDecision};

use crate::{AuditHandle, AuditRecord, DlqRecord, MessageEventRecord, MessageRecord};

fn lifecycle_event(msg: &RequestMessage, event_type: &str, details: Value) -> AuditRecord {
    AuditRecord::Event(MessageEventRecord {
        message_id: Some(msg.message_id.clone()),
        org_id: msg.org_id.clone(),
        event_type: event_type.to_string(),
        details: Some(details),
    })
}

/// Record created + enqueued and upsert the initial QUEUED snapshot.
pub async fn audit_created_enqueued(audit: &AuditHandle, msg: &RequestMessage) {
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::QUEUED,
        )))
        .await;
    audit
        .record(lifecycle_event(msg, event::CREATED, json!({"source": "producer"})))
        .await;
    audit
        .record(lifecycle_event(
            msg,
            event::ENQUEUED,
            json!({"queue": format!("org.{}.requests", msg.org_id)}),
        ))
        .await;
}

/// Record dequeued + processing and upsert the PROCESSING snapshot.
pub async fn audit_dequeued_processing(audit: &AuditHandle, msg: &RequestMessage, worker_id: &str) {
    audit
        .record(lifecycle_event(
            msg,
            event::DEQUEUED,
            json!({"queue": format!("org.{}.requests", msg.org_id)}),
        ))
        .await;
    audit
        .record(lifecycle_event(msg, event::PROCESSING, json!({"worker": worker_id})))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::PROCESSING,
        )))
        .await;
}

/// Record completion. The caller flushes afterwards so the terminal event
/// is durable before the broker ack.
pub async fn audit_completed(audit: &AuditHandle, msg: &RequestMessage, worker_id: &str) {
    audit
        .record(lifecycle_event(msg, event::COMPLETED, json!({"worker": worker_id})))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::COMPLETED,
        )))
        .await;
}

/// Record a failed attempt followed by a scheduled retry, including the
/// demotion event when the priority class changed. `msg` carries the
/// already-bumped `retry_count` and demoted priority.
pub async fn audit_failed_then_retry(
    audit: &AuditHandle,
    msg: &RequestMessage,
    decision: &RetryDecision,
    detail: &str,
    previous_priority: Priority,
) {
    audit
        .record(lifecycle_event(
            msg,
            event::FAILED,
            json!({"error_kind": decision.error_kind.as_str(), "detail": detail}),
        ))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::FAILED,
        )))
        .await;
    if msg.priority != previous_priority {
        audit
            .record(lifecycle_event(
                msg,
                event::DEMOTED,
                json!({
                    "from": previous_priority.as_u8(),
                    "to": msg.priority.as_u8(),
                }),
            ))
            .await;
    }
    audit
        .record(lifecycle_event(
            msg,
            event::RETRY_SCHEDULED,
            json!({
                "delay_ms": decision.delay_ms,
                "retry_count": msg.retry_count,
                "strategy": decision.strategy.label(),
                "error_kind": decision.error_kind.as_str(),
            }),
        ))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::RETRYING,
        )))
        .await;
}

/// Record a terminal failure: dead_letter event, DLQ row with the full
/// error history, and the DEAD_LETTERED snapshot. The caller flushes
/// before acking.
pub async fn audit_dead_letter(
    audit: &AuditHandle,
    msg: &RequestMessage,
    reason: &str,
    error_history: Value,
) {
    audit
        .record(lifecycle_event(msg, event::DEAD_LETTER, json!({"reason": reason})))
        .await;
    audit
        .record(AuditRecord::Dlq(DlqRecord {
            org_id: msg.org_id.clone(),
            original_message: serde_json::to_value(msg).unwrap_or(Value::Null),
            error_history,
            can_replay: true,
        }))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::DEAD_LETTERED,
        )))
        .await;
}

/// Record that a duplicate delivery was collapsed without handler work.
pub async fn audit_duplicate_skipped(audit: &AuditHandle, msg: &RequestMessage, dedup_key: &str) {
    audit
        .record(lifecycle_event(
            msg,
            event::DUPLICATE_SKIPPED,
            json!({"dedup_key": dedup_key}),
        ))
        .await;
}

/// Record a poison quarantine and the QUARANTINED snapshot.
pub async fn audit_poison_quarantined(
    audit: &AuditHandle,
    msg: &RequestMessage,
    dedup_key: &str,
    fail_count: i32,
) {
    audit
        .record(lifecycle_event(
            msg,
            event::POISON_QUARANTINED,
            json!({"dedup_key": dedup_key, "fail_count": fail_count}),
        ))
        .await;
    audit
        .record(AuditRecord::Message(MessageRecord::from_message(
            msg,
            status::QUARANTINED,
        )))
        .await;
}

/// Record a time-based priority promotion.
pub async fn audit_promoted(
    audit: &AuditHandle,
    message_id: &str,
    org_id: &str,
    from: Priority,
    to: Priority,
    age_ms: i64,
) {
    audit
        .record(AuditRecord::Event(MessageEventRecord {
            message_id: Some(message_id.to_string()),
            org_id: org_id.to_string(),
            event_type: event::PROMOTED.to_string(),
            details: Some(json!({
                "from": from.as_u8(),
                "to": to.as_u8(),
                "age_ms": age_ms,
            })),
        }))
        .await;
}

/// Record a DLQ replay back onto the org queue.
pub async fn audit_replayed(audit: &AuditHandle, message_id: &str, org_id: &str) {
    audit
        .record(AuditRecord::Event(MessageEventRecord {
            message_id: Some(message_id.to_string()),
            org_id: org_id.to_string(),
            event_type: event::REPLAYED.to_string(),
            details: Some(json!({"source": "dlq_replay"})),
        }))
        .await;
}

/// Record that the external resolver flagged a potential conflict.
pub async fn audit_conflict_detected(
    audit: &AuditHandle,
    message_id: Option<&str>,
    org_id: &str,
    resource: &str,
    reason: &str,
) {
    audit
        .record(AuditRecord::Event(MessageEventRecord {
            message_id: message_id.map(str::to_string),
            org_id: org_id.to_string(),
            event_type: event::CONFLICT_DETECTED.to_string(),
            details: Some(json!({"resource": resource, "reason": reason})),
        }))
        .await;
}

/// Record that the external resolver settled a conflict.
pub async fn audit_conflict_resolved(
    audit: &AuditHandle,
    message_id: Option<&str>,
    org_id: &str,
    resolution: &str,
) {
    audit
        .record(AuditRecord::Event(MessageEventRecord {
            message_id: message_id.map(str::to_string),
            org_id: org_id.to_string(),
            event_type: event::CONFLICT_RESOLVED.to_string(),
            details: Some(json!({"resolution": resolution})),
        }))
        .await;
}

/// Record that conflict resolution failed and needs human attention.
pub async fn audit_conflict_resolution_failed(
    audit: &AuditHandle,
    message_id: Option<&str>,
    org_id: &str,
    error: &str,
) {
    audit
        .record(AuditRecord::Event(MessageEventRecord {
            message_id: message_id.map(str::to_string),
            org_id: org_id.to_string(),
            event_type: event::CONFLICT_RESOLUTION_FAILED.to_string(),
            details: Some(json!({"error": error})),
        }))
        .await;
}

/// Append one failure entry to a message's rolling error history.
#[must_use]
pub fn push_error_history(history: Value, kind: ErrorKind, detail: &str, retry_count: u32) -> Value {
    let mut entries = match history {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };
    entries.push(json!({
        "kind": kind.as_str(),
        "detail": detail,
        "retry_count": retry_count,
        "at": chrono::Utc::now().to_rfc3339(),
    }));
    Value::Array(entries)
}
