/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! One-shot publisher.
//!
//! Builds a request from flags (or their environment fallbacks), runs it
//! through the full producing path (validation, backpressure, idempotency,
//! confirm policy, audit) and prints the outcome. Useful for smoke tests
//! and retry-path drills (`--force-error`).

#![allow(clippy::module_name_repetitions)]

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use relayq_broker::{ensure_org_topology, queue_depth, Broker};
use relayq_client::{BackpressureController, Producer, PublishOutcome, RejectReason};
use relayq_config::Config;
use relayq_protocol::{
    CreatedBy, CreatedByKind, MessageType, Priority, RequestMessage, SCHEMA_VERSION,
};
use relayq_store::{spawn_writer, Store};

const SERVICE_NAME: &str = "producer";

const EXIT_CONFIG: i32 = 2;
const EXIT_BROKER: i32 = 3;
const EXIT_STORE: i32 = 4;

const TOPOLOGY_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "relayq-producer", about = "Publish one message to an org queue")]
struct Args {
    /// Target organization.
    #[arg(long, env = "ORG_ID", default_value = "demo-org")]
    org_id: String,

    /// Destination agent for responses.
    #[arg(long, env = "AGENT_ID", default_value = "demo-agent")]
    agent_id: String,

    /// Operation type (model_call, tool_call, agent_message, ...).
    #[arg(long, env = "TYPE", default_value = "agent_message")]
    message_type: String,

    /// Logical priority: 0..3 or P0..P3.
    #[arg(long, env = "PRIORITY", default_value = "2")]
    priority: String,

    /// Idempotency key; repeated publishes with the same key collapse.
    #[arg(long, env = "DEDUP_KEY")]
    dedup_key: Option<String>,

    /// Inline JSON payload.
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Preserve priority across retries.
    #[arg(long)]
    no_demote: bool,

    /// Make the handler fail, exercising the retry/DLQ path.
    #[arg(long, env = "FORCE_ERROR")]
    force_error: bool,

    /// Error kind for --force-error (rate_limit, transient_io, ...).
    #[arg(long)]
    force_error_kind: Option<String>,

    /// Number of copies to publish (load drills).
    #[arg(long, default_value_t = 1)]
    count: u32,
}

fn parse_message_type(value: &str) -> Option<MessageType> {
    serde_json::from_value(json!(value)).ok()
}

fn build_message(args: &Args, message_type: MessageType, priority: Priority) -> RequestMessage {
    let mut context = serde_json::Map::new();
    context.insert("demo".to_string(), json!(true));
    if args.force_error {
        context.insert("force_error".to_string(), json!(true));
        if let Some(ref kind) = args.force_error_kind {
            context.insert("force_error_kind".to_string(), json!(kind));
        }
    }
    RequestMessage {
        message_id: String::new(),
        schema_version: SCHEMA_VERSION.to_string(),
        org_id: args.org_id.clone(),
        agent_id: Some(args.agent_id.clone()),
        user_id: None,
        goal_id: None,
        task_id: None,
        parent_message_id: None,
        created_by: CreatedBy {
            kind: CreatedByKind::System,
            id: SERVICE_NAME.to_string(),
        },
        message_type,
        priority,
        created_at: chrono::Utc::now(),
        expires_at: None,
        retry_count: 0,
        max_retries: 3,
        dedup_key: args.dedup_key.clone(),
        no_demote: args.no_demote,
        context: Some(serde_json::Value::Object(context)),
        resource_limits: None,
        payload: serde_json::from_str(&args.payload).unwrap_or(json!({})),
    }
}

fn exit_code_for(outcome: &PublishOutcome) -> i32 {
    match outcome {
        PublishOutcome::Accepted { .. } => 0,
        PublishOutcome::Rejected { reason } => match reason {
            RejectReason::Validation(_) | RejectReason::UnsupportedSchema(_) => EXIT_CONFIG,
            RejectReason::BrokerUnavailable => EXIT_BROKER,
            RejectReason::StoreUnavailable => EXIT_STORE,
            RejectReason::BackpressureReject => 1,
        },
    }
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

    let Some(message_type) = parse_message_type(&args.message_type) else {
        eprintln!("fatal: unknown message type: {}", args.message_type);
        process::exit(EXIT_CONFIG);
    };
    let priority = Priority::parse_lenient(&args.priority);

    let broker = match Broker::connect(&config.broker).await {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "broker connect failed");
            process::exit(EXIT_BROKER);
        }
    };
    let store = match Store::connect(&config.event_store).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "event store connect failed");
            process::exit(EXIT_STORE);
        }
    };
    let (audit, audit_task) = spawn_writer(store.clone(), &config.audit);

    if let Err(e) = ensure_org_topology(&broker, &args.org_id, TOPOLOGY_ATTEMPTS).await {
        error!(error = %e, "topology declaration failed");
        process::exit(EXIT_BROKER);
    }

    // Seed the backpressure stage from one fresh depth probe so a one-shot
    // publish still honors the tiers.
    let controller = Arc::new(BackpressureController::new(&config.backpressure));
    match broker.create_channel().await {
        Ok(channel) => {
            if let Ok(depth) = queue_depth(&channel, &args.org_id).await {
                controller.observe(&args.org_id, depth);
            }
        }
        Err(e) => error!(error = %e, "depth probe channel failed"),
    }

    let producer = match Producer::new(
        &broker,
        store,
        audit.clone(),
        controller,
        &config.producer,
    )
    .await
    {
        Ok(producer) => producer,
        Err(e) => {
            error!(error = %e, "producer init failed");
            process::exit(EXIT_BROKER);
        }
    };

    let mut exit = 0;
    for i in 0..args.count.max(1) {
        let msg = build_message(&args, message_type, priority);
        let outcome = producer.publish(msg).await;
        match &outcome {
            PublishOutcome::Accepted { duplicate } => {
                info!(n = i, duplicate, "accepted");
            }
            PublishOutcome::Rejected { reason } => {
                error!(n = i, reason = %reason, "rejected");
            }
        }
        exit = exit.max(exit_code_for(&outcome));
    }

    // Push buffered created/enqueued events out before exiting.
    if let Err(e) = audit.flush().await {
        error!(error = %e, "audit flush failed");
        exit = exit.max(EXIT_STORE);
    }
    drop(producer);
    drop(audit);
    let _ = tokio::time::timeout(Duration::from_secs(2), audit_task).await;
    process::exit(exit);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            org_id: "acme".to_string(),
            agent_id: "agent-1".to_string(),
            message_type: "model_call".to_string(),
            priority: "1".to_string(),
            dedup_key: Some("k1".to_string()),
            payload: r#"{"prompt": "hi"}"#.to_string(),
            no_demote: true,
            force_error: true,
            force_error_kind: Some("rate_limit".to_string()),
            count: 1,
        }
    }

    #[test]
    fn test_parse_message_type() {
        assert_eq!(parse_message_type("model_call"), Some(MessageType::ModelCall));
        assert_eq!(parse_message_type("memory_save"), Some(MessageType::MemorySave));
        assert_eq!(parse_message_type("bogus"), None);
    }

    #[test]
    fn test_build_message_carries_flags() {
        let msg = build_message(&args(), MessageType::ModelCall, Priority::P1);
        assert_eq!(msg.org_id, "acme");
        assert_eq!(msg.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(msg.priority, Priority::P1);
        assert!(msg.no_demote);
        assert_eq!(msg.dedup_key.as_deref(), Some("k1"));
        assert_eq!(msg.payload["prompt"], "hi");
        let context = msg.context.unwrap();
        assert_eq!(context["force_error"], true);
        assert_eq!(context["force_error_kind"], "rate_limit");
    }

    #[test]
    fn test_invalid_payload_falls_back_to_empty_object() {
        let mut a = args();
        a.payload = "not json".to_string();
        let msg = build_message(&a, MessageType::ToolCall, Priority::P2);
        assert_eq!(msg.payload, json!({}));
    }

    #[test]
    fn test_exit_codes_map_reasons() {
        assert_eq!(
            exit_code_for(&PublishOutcome::Accepted { duplicate: true }),
            0
        );
        assert_eq!(
            exit_code_for(&PublishOutcome::Rejected {
                reason: RejectReason::BrokerUnavailable
            }),
            EXIT_BROKER
        );
        assert_eq!(
            exit_code_for(&PublishOutcome::Rejected {
                reason: RejectReason::StoreUnavailable
            }),
            EXIT_STORE
        );
        assert_eq!(
            exit_code_for(&PublishOutcome::Rejected {
                reason: RejectReason::Validation("x".to_string())
            }),
            EXIT_CONFIG
        );
        assert_eq!(
            exit_code_for(&PublishOutcome::Rejected {
                reason: RejectReason::BackpressureReject
            }),
            1
        );
    }
}
