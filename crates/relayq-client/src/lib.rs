/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! The producing side of the bus.
//!
//! [`Producer::publish`] is the one entry point API front-ends, agents,
//! and the coordinator use to put work on an org queue. It validates and
//! stamps the message, honors the backpressure controller's directives,
//! enforces publish idempotency through the event store, picks the
//! confirm policy from the priority class, and emits the created/enqueued
//! audit trail. Every outcome is typed; nothing escapes as an untyped
//! failure.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod backpressure;
mod rate_limit;

pub use backpressure::{spawn_depth_sampler, BackpressureController};
pub use rate_limit::{build_rate_limiter, AsyncRateLimiter, TokenBucket, TokenBucketConfig};

use std::sync::Arc;
use std::time::Instant;

use lapin::Channel;
use tracing::{debug, warn};

use relayq_broker::{publish_request, Broker, BrokerError};
use relayq_config::ProducerConfig;
use relayq_protocol::{Priority, ProtocolError, RequestMessage, ThrottleStage};
use relayq_runtime::CircuitBreaker;
use relayq_store::{audit_created_enqueued, audit_duplicate_skipped, AuditHandle, Store};

/// Why a publish was refused. Producer errors are synchronous: the caller
/// gets the reason back on the same call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(String),
    #[error("broker unavailable")]
    BrokerUnavailable,
    #[error("event store unavailable")]
    StoreUnavailable,
    #[error("rejected by backpressure")]
    BackpressureReject,
}

impl RejectReason {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Validation(_) => "validation",
            RejectReason::UnsupportedSchema(_) => "unsupported_schema",
            RejectReason::BrokerUnavailable => "broker_unavailable",
            RejectReason::StoreUnavailable => "store_unavailable",
            RejectReason::BackpressureReject => "backpressure_reject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The message is on the queue, or already was: `duplicate` marks an
    /// idempotency collision, surfaced as success without a second enqueue.
    Accepted { duplicate: bool },
    Rejected { reason: RejectReason },
}

impl PublishOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted { .. })
    }

    #[must_use]
    pub fn result_label(&self) -> &'static str {
        match self {
            PublishOutcome::Accepted { duplicate: false } => "ok",
            PublishOutcome::Accepted { duplicate: true } => "duplicate",
            PublishOutcome::Rejected { reason } => reason.label(),
        }
    }
}

const STORE_BREAKER_THRESHOLD: u32 = 5;
const STORE_BREAKER_HALF_OPEN_SECS: u64 = 15;

pub struct Producer {
    plain: Channel,
    confirmed: Channel,
    store: Store,
    audit: AuditHandle,
    controller: Arc<BackpressureController>,
    limiter: Option<AsyncRateLimiter>,
    store_breaker: CircuitBreaker,
}

impl Producer {
    /// Build a producer over an existing broker connection. Opens two
    /// channels up front: a plain one for the P0 fire-and-forget path and
    /// a confirm-selected one for everything else.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the channels cannot be opened.
    pub async fn new(
        broker: &Broker,
        store: Store,
        audit: AuditHandle,
        controller: Arc<BackpressureController>,
        config: &ProducerConfig,
    ) -> Result<Producer, BrokerError> {
        Ok(Producer {
            plain: broker.create_channel().await?,
            confirmed: broker.create_confirmed_channel().await?,
            store,
            audit,
            controller,
            limiter: build_rate_limiter(config),
            store_breaker: CircuitBreaker::new(
                "event-store",
                STORE_BREAKER_THRESHOLD,
                STORE_BREAKER_HALF_OPEN_SECS,
            ),
        })
    }

    /// Publish one message. Always resolves to a typed outcome.
    pub async fn publish(&self, mut msg: RequestMessage) -> PublishOutcome {
        let started = Instant::now();
        let outcome = self.publish_inner(&mut msg).await;
        let priority_label = msg.priority.label();
        metrics::counter!(
            "publish_attempt_total",
            "priority" => priority_label.clone(),
            "result" => outcome.result_label(),
        )
        .increment(1);
        metrics::histogram!("publish_latency_seconds", "priority" => priority_label)
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Publish a batch on the shared channels, preserving order. Used by
    /// batch-oriented callers like the DLQ replay tool.
    pub async fn publish_batch(&self, messages: Vec<RequestMessage>) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for msg in messages {
            outcomes.push(self.publish(msg).await);
        }
        outcomes
    }

    async fn publish_inner(&self, msg: &mut RequestMessage) -> PublishOutcome {
        msg.stamp();
        if let Err(e) = msg.validate() {
            let reason = match e {
                ProtocolError::UnsupportedSchema(v) => RejectReason::UnsupportedSchema(v),
                other => RejectReason::Validation(other.to_string()),
            };
            return PublishOutcome::Rejected { reason };
        }

        let stage = self.controller.stage(&msg.org_id);
        if stage.rejects(msg.priority) {
            metrics::counter!("backpressure_reject_total", "org_id" => msg.org_id.clone())
                .increment(1);
            return PublishOutcome::Rejected {
                reason: RejectReason::BackpressureReject,
            };
        }
        if stage.rate_limits(msg.priority) {
            if let Some(ref limiter) = self.limiter {
                let user = msg.user_id.as_deref().unwrap_or("anonymous");
                limiter.acquire(&msg.org_id, user).await;
            }
        }

        // Publish idempotency gate. The event store is the sole arbiter;
        // P0 fails open when the store is down, everything else surfaces
        // store_unavailable so the caller can decide.
        let mut inserted_key: Option<String> = None;
        if let Some(dedup_key) = msg.dedup_key.clone() {
            match self.gate_dedup_key(msg, &dedup_key).await {
                GateOutcome::FirstSeen => inserted_key = Some(dedup_key),
                GateOutcome::Duplicate => {
                    metrics::counter!("idempotency_collision_total", "org_id" => msg.org_id.clone())
                        .increment(1);
                    audit_duplicate_skipped(&self.audit, msg, &dedup_key).await;
                    return PublishOutcome::Accepted { duplicate: true };
                }
                GateOutcome::StoreDown => {
                    if msg.priority != Priority::P0 {
                        return PublishOutcome::Rejected {
                            reason: RejectReason::StoreUnavailable,
                        };
                    }
                    // fall through fail-open for P0
                }
            }
        }

        // Confirm policy: P0 is fire-and-forget to keep publish overhead
        // under the latency budget; under emergency backpressure even P0
        // publishes get confirms so nothing is silently lost.
        let confirm = msg.priority != Priority::P0 || stage == ThrottleStage::Emergency;
        let channel = if confirm { &self.confirmed } else { &self.plain };
        if let Err(e) = publish_request(channel, msg, confirm).await {
            warn!(message_id = %msg.message_id, org_id = %msg.org_id, error = %e,
                  "publish failed");
            metrics::counter!("publish_failed_total", "reason" => "broker").increment(1);
            if let Some(key) = inserted_key {
                if let Err(rollback) = self.store.remove_idempotency_key(&msg.org_id, &key).await {
                    warn!(dedup_key = %key, error = %rollback,
                          "idempotency rollback failed after publish failure");
                }
            }
            return PublishOutcome::Rejected {
                reason: RejectReason::BrokerUnavailable,
            };
        }

        audit_created_enqueued(&self.audit, msg).await;
        debug!(message_id = %msg.message_id, org_id = %msg.org_id,
               priority = %msg.priority.label(), "message enqueued");
        PublishOutcome::Accepted { duplicate: false }
    }

    async fn gate_dedup_key(&self, msg: &RequestMessage, dedup_key: &str) -> GateOutcome {
        if self.store_breaker.check().is_err() {
            return GateOutcome::StoreDown;
        }
        match self
            .store
            .try_insert_idempotency_key(&msg.org_id, dedup_key)
            .await
        {
            Ok(true) => {
                self.store_breaker.record_success();
                GateOutcome::FirstSeen
            }
            Ok(false) => {
                self.store_breaker.record_success();
                GateOutcome::Duplicate
            }
            Err(e) => {
                warn!(org_id = %msg.org_id, dedup_key, error = %e, "idempotency check failed");
                self.store_breaker.record_failure();
                GateOutcome::StoreDown
            }
        }
    }
}

enum GateOutcome {
    FirstSeen,
    Duplicate,
    StoreDown,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            PublishOutcome::Accepted { duplicate: false }.result_label(),
            "ok"
        );
        assert_eq!(
            PublishOutcome::Accepted { duplicate: true }.result_label(),
            "duplicate"
        );
        assert_eq!(
            PublishOutcome::Rejected {
                reason: RejectReason::BackpressureReject
            }
            .result_label(),
            "backpressure_reject"
        );
        assert_eq!(
            PublishOutcome::Rejected {
                reason: RejectReason::UnsupportedSchema("3.0.0".to_string())
            }
            .result_label(),
            "unsupported_schema"
        );
    }

    #[test]
    fn test_duplicate_counts_as_accepted() {
        assert!(PublishOutcome::Accepted { duplicate: true }.is_accepted());
        assert!(!PublishOutcome::Rejected {
            reason: RejectReason::BrokerUnavailable
        }
        .is_accepted());
    }

    #[test]
    fn test_reject_reason_display() {
        let reason = RejectReason::Validation("missing required field: org_id".to_string());
        assert_eq!(
            reason.to_string(),
            "validation failed: missing required field: org_id"
        );
        assert_eq!(RejectReason::StoreUnavailable.label(), "store_unavailable");
    }
}
