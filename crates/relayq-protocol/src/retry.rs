/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Retry policy selection and priority demotion for failed messages.
//!
//! The error kind alone picks the strategy; the message supplies the retry
//! bookkeeping. Demotion is one class per attempt, bounded at P3, unless the
//! message was published with `no_demote`.

use serde::Serialize;

use crate::error::ErrorKind;
use crate::message::{Priority, RequestMessage};

/// How a retriable failure is backed off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    Linear { delay_ms: u64 },
    Exponential { base_ms: u64, cap_ms: u64 },
}

impl RetryStrategy {
    /// Per-kind policy table.
    #[must_use]
    pub fn for_kind(kind: ErrorKind) -> RetryStrategy {
        match kind {
            ErrorKind::Validation
            | ErrorKind::UnsupportedSchema
            | ErrorKind::PermanentUpstream
            | ErrorKind::Poison => RetryStrategy::None,
            ErrorKind::RateLimit => RetryStrategy::Exponential {
                base_ms: 1_000,
                cap_ms: 60_000,
            },
            ErrorKind::TransientIo => RetryStrategy::Exponential {
                base_ms: 500,
                cap_ms: 30_000,
            },
            ErrorKind::HandlerTimeout => RetryStrategy::Linear { delay_ms: 5_000 },
            ErrorKind::Unknown => RetryStrategy::Exponential {
                base_ms: 1_000,
                cap_ms: 30_000,
            },
        }
    }

    /// Delay for a zero-based retry attempt, before jitter and bucketing.
    #[must_use]
    pub fn delay_ms(self, retry_count: u32) -> u64 {
        match self {
            RetryStrategy::None => 0,
            RetryStrategy::Linear { delay_ms } => delay_ms,
            RetryStrategy::Exponential { base_ms, cap_ms } => {
                let shift = retry_count.min(32);
                base_ms.saturating_mul(1_u64 << shift).min(cap_ms)
            }
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            RetryStrategy::None => "none",
            RetryStrategy::Linear { .. } => "linear",
            RetryStrategy::Exponential { .. } => "exponential",
        }
    }
}

/// Demote a logical priority one class, bounded at P3.
#[must_use]
pub fn demote_priority(current: Priority) -> Priority {
    current.demoted()
}

/// Apply ±`frac` jitter to a delay so synchronized failures don't reconverge
/// on the same redelivery instant.
#[must_use]
pub fn jittered(delay_ms: u64, frac: f64) -> u64 {
    if frac <= 0.0 || delay_ms == 0 {
        return delay_ms;
    }
    let delta = (delay_ms as f64 * frac).round();
    let low = (delay_ms as f64 - delta).max(0.0);
    let high = delay_ms as f64 + delta;
    let sampled = low + rand::random::<f64>() * (high - low);
    sampled.round() as u64
}

/// Decision computed for one failed delivery.
#[derive(Debug, Clone, Serialize)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay_ms: u64,
    pub next_priority: Priority,
    pub next_retry_count: u32,
    pub strategy: RetryStrategy,
    pub error_kind: ErrorKind,
}

impl RetryDecision {
    #[must_use]
    pub fn demotes(&self, from: Priority) -> bool {
        self.should_retry && self.next_priority != from
    }
}

/// Decide whether a failed message retries, with what delay, and at what
/// priority. Does not mutate the message.
#[must_use]
pub fn decide_retry(msg: &RequestMessage, kind: ErrorKind) -> RetryDecision {
    let strategy = RetryStrategy::for_kind(kind);
    let exhausted = msg.retry_count >= msg.max_retries;
    if matches!(strategy, RetryStrategy::None) || exhausted {
        return RetryDecision {
            should_retry: false,
            delay_ms: 0,
            next_priority: msg.priority,
            next_retry_count: msg.retry_count,
            strategy,
            error_kind: kind,
        };
    }

    let next_priority = if msg.no_demote {
        msg.priority
    } else {
        demote_priority(msg.priority)
    };

    RetryDecision {
        should_retry: true,
        delay_ms: strategy.delay_ms(msg.retry_count),
        next_priority,
        next_retry_count: msg.retry_count + 1,
        strategy,
        error_kind: kind,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{CreatedBy, CreatedByKind, MessageType};
    use chrono::Utc;

    fn message(priority: Priority, retry_count: u32, max_retries: u32) -> RequestMessage {
        RequestMessage {
            message_id: "m-1".to_string(),
            schema_version: crate::SCHEMA_VERSION.to_string(),
            org_id: "acme".to_string(),
            agent_id: None,
            user_id: None,
            goal_id: Some("g".to_string()),
            task_id: Some("t".to_string()),
            parent_message_id: None,
            created_by: CreatedBy {
                kind: CreatedByKind::System,
                id: "test".to_string(),
            },
            message_type: MessageType::ModelCall,
            priority,
            created_at: Utc::now(),
            expires_at: None,
            retry_count,
            max_retries,
            dedup_key: None,
            no_demote: false,
            context: None,
            resource_limits: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_non_retriable_kinds_never_retry() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::UnsupportedSchema,
            ErrorKind::PermanentUpstream,
            ErrorKind::Poison,
        ] {
            let d = decide_retry(&message(Priority::P1, 0, 3), kind);
            assert!(!d.should_retry, "{kind} must not retry");
            assert_eq!(d.next_retry_count, 0, "retry_count unchanged");
            assert_eq!(d.next_priority, Priority::P1, "priority unchanged");
        }
    }

    #[test]
    fn test_retry_demotes_and_increments() {
        let d = decide_retry(&message(Priority::P1, 0, 3), ErrorKind::TransientIo);
        assert!(d.should_retry);
        assert_eq!(d.next_priority, Priority::P2);
        assert_eq!(d.next_retry_count, 1);
    }

    #[test]
    fn test_demotion_bounded_at_p3() {
        let d = decide_retry(&message(Priority::P3, 1, 5), ErrorKind::Unknown);
        assert!(d.should_retry);
        assert_eq!(d.next_priority, Priority::P3);
    }

    #[test]
    fn test_no_demote_preserves_priority() {
        let mut msg = message(Priority::P0, 0, 3);
        msg.no_demote = true;
        let d = decide_retry(&msg, ErrorKind::RateLimit);
        assert!(d.should_retry);
        assert_eq!(d.next_priority, Priority::P0);
        assert_eq!(d.next_retry_count, 1);
    }

    #[test]
    fn test_exhausted_retries_stop() {
        let d = decide_retry(&message(Priority::P2, 3, 3), ErrorKind::TransientIo);
        assert!(!d.should_retry);
        assert_eq!(d.next_retry_count, 3);
    }

    #[test]
    fn test_rate_limit_backoff_caps_at_60s() {
        let strategy = RetryStrategy::for_kind(ErrorKind::RateLimit);
        assert_eq!(strategy.delay_ms(0), 1_000);
        assert_eq!(strategy.delay_ms(1), 2_000);
        assert_eq!(strategy.delay_ms(5), 32_000);
        assert_eq!(strategy.delay_ms(6), 60_000);
        assert_eq!(strategy.delay_ms(20), 60_000);
    }

    #[test]
    fn test_transient_io_backoff_caps_at_30s() {
        let strategy = RetryStrategy::for_kind(ErrorKind::TransientIo);
        assert_eq!(strategy.delay_ms(0), 500);
        assert_eq!(strategy.delay_ms(3), 4_000);
        assert_eq!(strategy.delay_ms(10), 30_000);
    }

    #[test]
    fn test_handler_timeout_is_linear() {
        let strategy = RetryStrategy::for_kind(ErrorKind::HandlerTimeout);
        assert_eq!(strategy.delay_ms(0), 5_000);
        assert_eq!(strategy.delay_ms(7), 5_000);
    }

    #[test]
    fn test_large_retry_count_does_not_overflow() {
        let strategy = RetryStrategy::for_kind(ErrorKind::Unknown);
        assert_eq!(strategy.delay_ms(u32::MAX), 30_000);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        for _ in 0..100 {
            let v = jittered(1_000, 0.1);
            assert!((900..=1_100).contains(&v), "jittered value {v} out of band");
        }
        assert_eq!(jittered(1_000, 0.0), 1_000);
        assert_eq!(jittered(0, 0.1), 0);
    }

    #[test]
    fn test_demotes_reports_priority_change() {
        let from = Priority::P1;
        let d = decide_retry(&message(from, 0, 3), ErrorKind::TransientIo);
        assert!(d.demotes(from));
        let mut msg = message(from, 0, 3);
        msg.no_demote = true;
        let d = decide_retry(&msg, ErrorKind::TransientIo);
        assert!(!d.demotes(from));
    }
}
