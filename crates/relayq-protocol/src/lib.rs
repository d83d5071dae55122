/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared wire vocabulary for the relayq message bus.
//!
//! Everything in this crate is pure data and decision logic: request and
//! response shapes, the error taxonomy, retry/demotion policy, schema
//! version gating, and backpressure throttle stages. No IO lives here so
//! producers, workers, coordinators, and the admin tools all agree on the
//! same types without dragging broker or store dependencies around.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod message;
mod response;
mod retry;
mod throttle;

pub use error::{ErrorKind, HandlerError, ProtocolError};
pub use message::{
    CreatedBy, CreatedByKind, EnvelopeHeaders, MessageType, Priority, RequestMessage,
};
pub use response::{ErrorDetail, Response, ResponseBody};
pub use retry::{decide_retry, demote_priority, jittered, RetryDecision, RetryStrategy};
pub use throttle::{decide_stage, BackpressureThresholds, ThrottleStage};

/// Major version of the message schema this build speaks natively.
pub const SCHEMA_MAJOR: u64 = 1;

/// Schema version stamped on messages produced by this build.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Message statuses persisted in the `messages` table.
pub mod status {
    pub const QUEUED: &str = "QUEUED";
    pub const PROCESSING: &str = "PROCESSING";
    pub const COMPLETED: &str = "COMPLETED";
    pub const FAILED: &str = "FAILED";
    pub const RETRYING: &str = "RETRYING";
    pub const DEAD_LETTERED: &str = "DEAD_LETTERED";
    pub const DUPLICATE: &str = "DUPLICATE";
    pub const QUARANTINED: &str = "QUARANTINED";

    /// Terminal statuses: once a message reaches one of these, later broker
    /// copies (retries that raced an ack, promotion re-publishes) are
    /// collapsed at dequeue instead of reprocessed.
    #[must_use]
    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | DEAD_LETTERED | QUARANTINED | DUPLICATE)
    }
}

/// Lifecycle event types appended to `message_events`.
pub mod event {
    pub const CREATED: &str = "created";
    pub const ENQUEUED: &str = "enqueued";
    pub const DEQUEUED: &str = "dequeued";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const PROMOTED: &str = "promoted";
    pub const DEMOTED: &str = "demoted";
    pub const DEAD_LETTER: &str = "dead_letter";
    pub const DUPLICATE_SKIPPED: &str = "duplicate_skipped";
    pub const POISON_QUARANTINED: &str = "poison_quarantined";
    pub const REPLAYED: &str = "replayed";
    // Emitted on behalf of the external conflict resolver; the resolver
    // itself lives outside this system.
    pub const CONFLICT_DETECTED: &str = "conflict_detected";
    pub const CONFLICT_RESOLVED: &str = "conflict_resolved";
    pub const CONFLICT_RESOLUTION_FAILED: &str = "conflict_resolution_failed";

    /// Terminal lifecycle events must be durably recorded before the broker
    /// delivery is acknowledged.
    #[must_use]
    pub fn is_terminal(event_type: &str) -> bool {
        matches!(event_type, COMPLETED | DEAD_LETTER)
    }
}

/// Check that a semantic `schema_version` falls inside the supported window:
/// the current major and the previous one.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedSchema`] for malformed versions and
/// for majors outside the window.
pub fn check_schema_window(version: &str) -> Result<(), ProtocolError> {
    let mut parts = version.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::UnsupportedSchema(version.to_string()))?;
    let minor_ok = parts.next().is_some_and(|p| p.parse::<u64>().is_ok());
    let patch_ok = parts.next().is_some_and(|p| p.parse::<u64>().is_ok());
    if !(minor_ok && patch_ok) || parts.next().is_some() {
        return Err(ProtocolError::UnsupportedSchema(version.to_string()));
    }
    let floor = SCHEMA_MAJOR.saturating_sub(1);
    if major < floor || major > SCHEMA_MAJOR {
        return Err(ProtocolError::UnsupportedSchema(version.to_string()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_window_accepts_current_and_previous_major() {
        assert!(check_schema_window("1.0.0").is_ok());
        assert!(check_schema_window("1.4.2").is_ok());
        assert!(check_schema_window("0.9.0").is_ok());
    }

    #[test]
    fn test_schema_window_rejects_future_major() {
        assert!(check_schema_window("2.0.0").is_err());
        assert!(check_schema_window("7.1.0").is_err());
    }

    #[test]
    fn test_schema_window_rejects_malformed() {
        assert!(check_schema_window("1.0").is_err());
        assert!(check_schema_window("1.0.0.0").is_err());
        assert!(check_schema_window("one.two.three").is_err());
        assert!(check_schema_window("").is_err());
    }

    #[test]
    fn test_terminal_status_set() {
        assert!(status::is_terminal(status::COMPLETED));
        assert!(status::is_terminal(status::DEAD_LETTERED));
        assert!(status::is_terminal(status::QUARANTINED));
        assert!(status::is_terminal(status::DUPLICATE));
        assert!(!status::is_terminal(status::QUEUED));
        assert!(!status::is_terminal(status::RETRYING));
        assert!(!status::is_terminal(status::PROCESSING));
    }

    #[test]
    fn test_terminal_event_set() {
        assert!(event::is_terminal(event::COMPLETED));
        assert!(event::is_terminal(event::DEAD_LETTER));
        assert!(!event::is_terminal(event::FAILED));
        assert!(!event::is_terminal(event::RETRY_SCHEDULED));
    }
}
