/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Idempotent broker topology declaration.
//!
//! Stable, user-visible names:
//! - `org.{org_id}.requests`: durable priority queue (requests)
//! - `org.{org_id}.dlq`: durable dead-letter queue
//! - `org.{org_id}.retry.{delay_ms}`: TTL'd holding queues that
//!   dead-letter back onto the requests queue
//! - `responses.{org_id}`: direct exchange for response routing
//! - `agent.{agent_id}.responses`: durable per-agent queue bound by
//!   routing key `agent_id`
//!
//! Consumers must not start before the declarations for their org succeed.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, ExchangeKind};
use std::time::Duration;
use tracing::{info, warn};

use crate::{Broker, BrokerError};
use relayq_runtime::Backoff;

/// The broker queue speaks ten native priority levels; logical P0..P3 map
/// onto 9/6/3/0.
const MAX_PRIORITY_LEVELS: i32 = 10;

/// Fixed holding-queue delays. Computed retry delays are rounded down onto
/// this ladder because each bucket is one TTL'd queue.
pub const RETRY_LADDER_MS: [u64; 9] = [
    500, 1_000, 2_000, 4_000, 5_000, 8_000, 16_000, 30_000, 60_000,
];

#[must_use]
pub fn request_queue(org_id: &str) -> String {
    format!("org.{org_id}.requests")
}

#[must_use]
pub fn dlq_queue(org_id: &str) -> String {
    format!("org.{org_id}.dlq")
}

#[must_use]
pub fn retry_queue(org_id: &str, delay_ms: u64) -> String {
    format!("org.{org_id}.retry.{delay_ms}")
}

#[must_use]
pub fn response_exchange(org_id: &str) -> String {
    format!("responses.{org_id}")
}

#[must_use]
pub fn agent_response_queue(agent_id: &str) -> String {
    format!("agent.{agent_id}.responses")
}

/// Largest ladder bucket not exceeding `delay_ms`; the smallest bucket for
/// anything shorter.
#[must_use]
pub fn retry_bucket(delay_ms: u64) -> u64 {
    RETRY_LADDER_MS
        .iter()
        .rev()
        .copied()
        .find(|bucket| *bucket <= delay_ms)
        .unwrap_or(RETRY_LADDER_MS[0])
}

/// Partial declaration failure: names every resource that did not succeed
/// so operators can see exactly what is missing.
#[derive(thiserror::Error, Debug)]
#[error("topology declaration failed for [{}]: {}", .failed.join(", "), .source)]
pub struct TopologyError {
    pub failed: Vec<String>,
    #[source]
    pub source: lapin::Error,
}

struct DeclareOutcome {
    failed: Vec<String>,
    last_error: Option<lapin::Error>,
}

impl DeclareOutcome {
    fn new() -> Self {
        DeclareOutcome {
            failed: Vec::new(),
            last_error: None,
        }
    }

    fn note(&mut self, resource: String, result: Result<(), lapin::Error>) {
        if let Err(e) = result {
            warn!(resource = %resource, error = %e, "declaration failed");
            self.failed.push(resource);
            self.last_error = Some(e);
        }
    }

    fn into_result(self) -> Result<(), TopologyError> {
        match self.last_error {
            None => Ok(()),
            Some(source) => Err(TopologyError {
                failed: self.failed,
                source,
            }),
        }
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// Declare the request queue, DLQ, and retry ladder for one org.
///
/// All declarations are idempotent; re-running against existing resources
/// is a no-op as long as the arguments match.
///
/// # Errors
///
/// Returns [`TopologyError`] enumerating the resources that failed.
pub async fn declare_org_topology(channel: &Channel, org_id: &str) -> Result<(), TopologyError> {
    let mut outcome = DeclareOutcome::new();

    let requests = request_queue(org_id);
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-max-priority"),
        AMQPValue::LongInt(MAX_PRIORITY_LEVELS),
    );
    outcome.note(
        requests.clone(),
        channel
            .queue_declare(&requests, durable(), args)
            .await
            .map(|_| ()),
    );

    let dlq = dlq_queue(org_id);
    outcome.note(
        dlq.clone(),
        channel
            .queue_declare(&dlq, durable(), FieldTable::default())
            .await
            .map(|_| ()),
    );

    for delay_ms in RETRY_LADDER_MS {
        let name = retry_queue(org_id, delay_ms);
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(i32::try_from(delay_ms).unwrap_or(i32::MAX)),
        );
        // Dead-letter through the default exchange straight back onto the
        // org requests queue, headers and priority intact.
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(String::new())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(requests.clone())),
        );
        outcome.note(
            name.clone(),
            channel
                .queue_declare(&name, durable(), args)
                .await
                .map(|_| ()),
        );
    }

    let result = outcome.into_result();
    if result.is_ok() {
        info!(org_id, "org topology declared");
    }
    result
}

/// Declare the response exchange for an org and bind one agent's queue.
///
/// # Errors
///
/// Returns [`TopologyError`] enumerating the resources that failed.
pub async fn declare_response_topology(
    channel: &Channel,
    org_id: &str,
    agent_id: &str,
) -> Result<(), TopologyError> {
    let mut outcome = DeclareOutcome::new();

    let exchange = response_exchange(org_id);
    outcome.note(
        exchange.clone(),
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await,
    );

    let queue = agent_response_queue(agent_id);
    outcome.note(
        queue.clone(),
        channel
            .queue_declare(&queue, durable(), FieldTable::default())
            .await
            .map(|_| ()),
    );
    outcome.note(
        format!("{queue} -> {exchange}"),
        channel
            .queue_bind(
                &queue,
                &exchange,
                agent_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await,
    );

    let result = outcome.into_result();
    if result.is_ok() {
        info!(org_id, agent_id, "response topology declared");
    }
    result
}

/// Declare org topology, retrying with bounded backoff on connection loss.
/// A failed declaration poisons its channel, so each attempt opens a fresh
/// one.
///
/// # Errors
///
/// Returns [`BrokerError`] when every attempt failed.
pub async fn ensure_org_topology(
    broker: &Broker,
    org_id: &str,
    attempts: u32,
) -> Result<(), BrokerError> {
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
    let mut last: Option<lapin::Error> = None;
    for attempt in 1..=attempts.max(1) {
        let channel = broker.create_channel().await?;
        match declare_org_topology(&channel, org_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(org_id, attempt, error = %e, "org topology attempt failed");
                last = Some(e.source);
            }
        }
        tokio::time::sleep(backoff.next_delay_jittered()).await;
    }
    Err(last.map_or(BrokerError::NotConfirmed, BrokerError::Amqp))
}

/// Declare response topology for one agent with the same retry discipline
/// as [`ensure_org_topology`].
///
/// # Errors
///
/// Returns [`BrokerError`] when every attempt failed.
pub async fn ensure_response_topology(
    broker: &Broker,
    org_id: &str,
    agent_id: &str,
    attempts: u32,
) -> Result<(), BrokerError> {
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
    let mut last: Option<lapin::Error> = None;
    for attempt in 1..=attempts.max(1) {
        let channel = broker.create_channel().await?;
        match declare_response_topology(&channel, org_id, agent_id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(org_id, agent_id, attempt, error = %e, "response topology attempt failed");
                last = Some(e.source);
            }
        }
        tokio::time::sleep(backoff.next_delay_jittered()).await;
    }
    Err(last.map_or(BrokerError::NotConfirmed, BrokerError::Amqp))
}
