/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Publish helpers.
//!
//! Requests, retries, and dead letters travel through the default exchange
//! (routing key = queue name); responses travel through the org's direct
//! exchange keyed by `agent_id`. Everything is persistent-delivery JSON
//! with the envelope headers mirrored into AMQP headers.

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel};

use relayq_protocol::{EnvelopeHeaders, RequestMessage, Response};

use crate::topology::{
    agent_response_queue, dlq_queue, request_queue, response_exchange, retry_bucket, retry_queue,
};
use crate::BrokerError;

const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

fn insert_string(table: &mut FieldTable, key: &str, value: &str) {
    table.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value.to_string())),
    );
}

/// Mirror the envelope headers into an AMQP header table so consumers and
/// intermediaries can route without parsing the body.
#[must_use]
pub fn headers_table(headers: &EnvelopeHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    insert_string(&mut table, "message_id", &headers.message_id);
    insert_string(&mut table, "org_id", &headers.org_id);
    if let Some(ref agent_id) = headers.agent_id {
        insert_string(&mut table, "agent_id", agent_id);
    }
    insert_string(&mut table, "type", headers.message_type.as_str());
    table.insert(
        ShortString::from("priority"),
        AMQPValue::LongInt(i32::from(headers.priority.as_u8())),
    );
    table.insert(
        ShortString::from("retry_count"),
        AMQPValue::LongInt(i32::try_from(headers.retry_count).unwrap_or(i32::MAX)),
    );
    insert_string(&mut table, "schema_version", &headers.schema_version);
    if let Some(ref dedup_key) = headers.dedup_key {
        insert_string(&mut table, "dedup_key", dedup_key);
    }
    table
}

fn request_properties(msg: &RequestMessage) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT)
        .with_priority(msg.priority.amqp_priority())
        .with_headers(headers_table(&EnvelopeHeaders::from_message(msg)))
}

async fn publish_confirmed(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    options: BasicPublishOptions,
    body: &[u8],
    properties: BasicProperties,
    confirm: bool,
) -> Result<(), BrokerError> {
    let confirmation = channel
        .basic_publish(exchange, routing_key, options, body, properties)
        .await?
        .await?;
    // On a non-confirm channel the broker sends nothing and the
    // confirmation resolves as NotRequested immediately.
    if confirm {
        if let lapin::publisher_confirm::Confirmation::Nack(_) = confirmation {
            return Err(BrokerError::NotConfirmed);
        }
    }
    Ok(())
}

/// Publish a request onto its org queue at the message's priority.
///
/// With `confirm` the call resolves only once the broker acks the publish;
/// without it the call returns as soon as the frame is written (the P0
/// fire-and-forget path; the channel must not be in confirm mode).
///
/// # Errors
///
/// Returns [`BrokerError`] on serialization, channel, or confirm failure.
pub async fn publish_request(
    channel: &Channel,
    msg: &RequestMessage,
    confirm: bool,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(msg)?;
    publish_confirmed(
        channel,
        "",
        &request_queue(&msg.org_id),
        BasicPublishOptions {
            mandatory: confirm,
            ..BasicPublishOptions::default()
        },
        &body,
        request_properties(msg),
        confirm,
    )
    .await
}

/// Publish a response frame to the org's response exchange, routed by
/// `agent_id`.
///
/// Workers emit on the fast fire-and-forget path (`confirm = false`); the
/// coordinator's misroute rerouting awaits the broker ack (`confirm =
/// true`, on a confirm-selected channel) because the original delivery is
/// only acked once the republished copy is safely on the broker.
///
/// # Errors
///
/// Returns [`BrokerError`] on serialization, channel, or confirm failure.
pub async fn publish_response(
    channel: &Channel,
    org_id: &str,
    response: &Response,
    confirm: bool,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(response)?;
    let mut table = FieldTable::default();
    insert_string(&mut table, "request_id", &response.request_id);
    insert_string(&mut table, "agent_id", &response.agent_id);
    insert_string(&mut table, "type", response.body.kind_label());
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT)
        .with_headers(table);
    publish_confirmed(
        channel,
        &response_exchange(org_id),
        &response.agent_id,
        BasicPublishOptions::default(),
        &body,
        properties,
        confirm,
    )
    .await
}

/// Park a failed message in the holding queue for `delay_ms` (rounded down
/// to the ladder); the queue's TTL + dead-letter hop re-delivers it onto
/// the org requests queue with headers and priority intact. The caller has
/// already bumped `retry_count` and applied demotion on `msg`.
///
/// # Errors
///
/// Returns [`BrokerError`] on serialization, channel, or confirm failure.
pub async fn schedule_retry(
    channel: &Channel,
    msg: &RequestMessage,
    delay_ms: u64,
) -> Result<(), BrokerError> {
    let bucket = retry_bucket(delay_ms);
    let body = serde_json::to_vec(msg)?;
    publish_confirmed(
        channel,
        "",
        &retry_queue(&msg.org_id, bucket),
        BasicPublishOptions::default(),
        &body,
        request_properties(msg),
        true,
    )
    .await
}

/// Ship a terminal failure to the org's dead-letter queue. The durable DLQ
/// row with the error history lives in the event store; this broker copy
/// carries the reason in a header for quick inspection.
///
/// # Errors
///
/// Returns [`BrokerError`] on serialization, channel, or confirm failure.
pub async fn publish_dlq(
    channel: &Channel,
    msg: &RequestMessage,
    reason: &str,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(msg)?;
    let mut table = headers_table(&EnvelopeHeaders::from_message(msg));
    insert_string(&mut table, "x-dlq-reason", reason);
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT)
        .with_headers(table);
    publish_confirmed(
        channel,
        "",
        &dlq_queue(&msg.org_id),
        BasicPublishOptions::default(),
        &body,
        properties,
        true,
    )
    .await
}

/// Current depth of the org request queue via a passive declare on the
/// existing connection. No management API required.
///
/// # Errors
///
/// Returns [`BrokerError::Amqp`] if the queue does not exist or the
/// channel failed.
pub async fn queue_depth(channel: &Channel, org_id: &str) -> Result<u64, BrokerError> {
    let queue = channel
        .queue_declare(
            &request_queue(org_id),
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(u64::from(queue.message_count()))
}

/// Depth of one agent's response queue; the coordinator samples this for
/// the mailbox metrics.
///
/// # Errors
///
/// Returns [`BrokerError::Amqp`] if the queue does not exist or the
/// channel failed.
pub async fn response_queue_depth(channel: &Channel, agent_id: &str) -> Result<u64, BrokerError> {
    let queue = channel
        .queue_declare(
            &agent_response_queue(agent_id),
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(u64::from(queue.message_count()))
}
