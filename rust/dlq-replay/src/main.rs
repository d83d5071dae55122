/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Replay DLQ rows back onto their org queue.
//!
//! Remediated messages go back with `retry_count` reset, a
//! `context.replayed_from` annotation, and a fresh QUEUED snapshot (the
//! stored terminal status would otherwise make the worker collapse the
//! replay as a duplicate). Overriding the original priority requires
//! `--yes` when any selected message had a different one.

#![allow(clippy::module_name_repetitions)]

use std::process;

use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use relayq_broker::{ensure_org_topology, publish_request, Broker};
use relayq_config::Config;
use relayq_protocol::{status, Priority, RequestMessage};
use relayq_store::{
    audit_replayed, spawn_writer, AuditRecord, DlqFilter, DlqRow, MessageRecord, Store,
};

const SERVICE_NAME: &str = "dlq-replay";

const EXIT_CONFIG: i32 = 2;
const EXIT_BROKER: i32 = 3;
const EXIT_STORE: i32 = 4;

const TOPOLOGY_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "relayq-dlq-replay", about = "Replay dead-lettered messages")]
struct Args {
    /// Organization whose DLQ to replay.
    #[arg(long, env = "ORG_ID")]
    org_id: String,

    /// Maximum rows to replay, oldest first.
    #[arg(long, alias = "batch", default_value_t = 1)]
    limit: i64,

    /// Override the replay priority (0..3 or P0..P3); defaults to each
    /// message's original priority.
    #[arg(long)]
    priority: Option<String>,

    /// Filter by message type.
    #[arg(long = "type")]
    message_type: Option<String>,

    /// ISO 8601 lower bound on dlq_timestamp (inclusive).
    #[arg(long)]
    since: Option<String>,

    /// ISO 8601 upper bound on dlq_timestamp (inclusive).
    #[arg(long)]
    until: Option<String>,

    /// Show what would be replayed without publishing.
    #[arg(long)]
    dry_run: bool,

    /// Confirm replaying with an overridden priority.
    #[arg(long)]
    yes: bool,
}

fn parse_timestamp(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Rebuild the request from the stored DLQ row and prepare it for
/// re-enqueue: retry bookkeeping reset and replay provenance annotated.
fn prepare_replay(row: &DlqRow, priority_override: Option<Priority>) -> Option<RequestMessage> {
    let mut msg: RequestMessage = serde_json::from_value(row.original_message.clone()).ok()?;
    msg.retry_count = 0;
    if let Some(priority) = priority_override {
        msg.priority = priority;
    }
    let mut context = match msg.context.take() {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    context.insert("replayed_from".to_string(), json!({"dlq": true}));
    msg.context = Some(Value::Object(context));
    Some(msg)
}

/// Count rows whose original priority differs from the requested override.
fn count_priority_overrides(rows: &[DlqRow], priority: Priority) -> usize {
    rows.iter()
        .filter(|row| {
            row.original_message
                .get("priority")
                .and_then(Value::as_u64)
                .is_some_and(|p| p != u64::from(priority.as_u8()))
        })
        .count()
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("fatal: failed to load config: {e}");
        process::exit(EXIT_CONFIG);
    });

    let _telemetry_guard = relayq_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry)
        .unwrap_or_else(|e| {
            eprintln!("fatal: telemetry init failed: {e}");
            process::exit(1);
        });

    let since = match args.since.as_deref().map(parse_timestamp) {
        Some(None) => {
            eprintln!("fatal: --since must be RFC 3339");
            process::exit(EXIT_CONFIG);
        }
        other => other.flatten(),
    };
    let until = match args.until.as_deref().map(parse_timestamp) {
        Some(None) => {
            eprintln!("fatal: --until must be RFC 3339");
            process::exit(EXIT_CONFIG);
        }
        other => other.flatten(),
    };
    let priority_override = args.priority.as_deref().map(Priority::parse_lenient);

    let store = match Store::connect(&config.event_store).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "event store connect failed");
            process::exit(EXIT_STORE);
        }
    };

    let filter = DlqFilter {
        org_id: args.org_id.clone(),
        message_type: args.message_type.clone(),
        since,
        until,
        limit: args.limit,
    };
    let rows = match store.fetch_replayable(&filter).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "DLQ query failed");
            process::exit(EXIT_STORE);
        }
    };
    if rows.is_empty() {
        info!("no DLQ messages matched");
        return;
    }

    if let Some(priority) = priority_override {
        let overridden = count_priority_overrides(&rows, priority);
        if overridden > 0 && !args.yes {
            error!(
                overridden,
                "refusing to replay with overridden priority without --yes"
            );
            process::exit(EXIT_CONFIG);
        }
    }

    if args.dry_run {
        info!(count = rows.len(), org_id = %args.org_id, "dry-run: would replay");
        for row in &rows {
            let message_id = row
                .original_message
                .get("message_id")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            info!(dlq_id = row.id, message_id, dlq_timestamp = %row.dlq_timestamp, "candidate");
        }
        return;
    }

    let broker = match Broker::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "broker connect failed");
            process::exit(EXIT_BROKER);
        }
    };
    if let Err(e) = ensure_org_topology(&broker, &args.org_id, TOPOLOGY_ATTEMPTS).await {
        error!(error = %e, "topology declaration failed");
        process::exit(EXIT_BROKER);
    }
    let channel = match broker.create_confirmed_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            error!(error = %e, "channel open failed");
            process::exit(EXIT_BROKER);
        }
    };
    let (audit, audit_task) = spawn_writer(store.clone(), &config.audit);

    let mut replayed = 0u64;
    for row in &rows {
        let Some(msg) = prepare_replay(row, priority_override) else {
            warn!(dlq_id = row.id, "unparseable DLQ row skipped");
            continue;
        };
        if let Err(e) = publish_request(&channel, &msg, true).await {
            error!(dlq_id = row.id, message_id = %msg.message_id, error = %e, "replay publish failed");
            continue;
        }
        // Reset the snapshot to QUEUED so the worker's duplicate gate does
        // not collapse the replay against the old terminal status.
        audit
            .record(AuditRecord::Message(MessageRecord::from_message(
                &msg,
                status::QUEUED,
            )))
            .await;
        audit_replayed(&audit, &msg.message_id, &args.org_id).await;
        metrics::counter!("dlq_replay_total", "org_id" => args.org_id.clone()).increment(1);
        info!(message_id = %msg.message_id, priority = %msg.priority.label(), "replayed");
        replayed += 1;
    }

    if let Err(e) = audit.flush().await {
        error!(error = %e, "audit flush failed");
        process::exit(EXIT_STORE);
    }
    drop(audit);
    let _ = audit_task.await;
    info!(replayed, total = rows.len(), "replay complete");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dlq_row(priority: u8) -> DlqRow {
        DlqRow {
            id: 1,
            original_message: json!({
                "message_id": "m-1",
                "schema_version": "1.0.0",
                "org_id": "acme",
                "created_by": {"kind": "system", "id": "test"},
                "type": "tool_call",
                "priority": priority,
                "created_at": "2026-01-05T10:00:00Z",
                "retry_count": 3,
                "max_retries": 3,
                "payload": {},
            }),
            dlq_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_prepare_replay_resets_retry_state() {
        let msg = prepare_replay(&dlq_row(2), None).unwrap();
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.priority, Priority::P2, "original priority kept");
        assert_eq!(msg.context.unwrap()["replayed_from"], json!({"dlq": true}));
    }

    #[test]
    fn test_prepare_replay_applies_override() {
        let msg = prepare_replay(&dlq_row(3), Some(Priority::P1)).unwrap();
        assert_eq!(msg.priority, Priority::P1);
    }

    #[test]
    fn test_override_counting() {
        let rows = vec![dlq_row(2), dlq_row(1), dlq_row(2)];
        assert_eq!(count_priority_overrides(&rows, Priority::P2), 1);
        assert_eq!(count_priority_overrides(&rows, Priority::P0), 3);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert!(parse_timestamp("2026-01-05T10:00:00Z").is_some());
        assert!(parse_timestamp("2026-01-05T10:00:00+02:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_args_accept_batch_alias() {
        let args = Args::try_parse_from([
            "relayq-dlq-replay",
            "--org-id",
            "acme",
            "--batch",
            "25",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.limit, 25);
        assert!(args.dry_run);
    }
}
