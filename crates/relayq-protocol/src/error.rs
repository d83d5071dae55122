/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors produced while constructing or validating wire types.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("priority out of range: {0} (expected 0..=3)")]
    InvalidPriority(u8),
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(String),
    #[error("malformed message body: {0}")]
    Malformed(String),
}

/// The failure taxonomy the worker's retry policy is keyed on.
///
/// Handlers surface one of these kinds for every failure; the queue never
/// sees an untyped error cross the handler boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnsupportedSchema,
    RateLimit,
    TransientIo,
    HandlerTimeout,
    PermanentUpstream,
    /// Repeated worker crash on the same dedup key; quarantined, never
    /// produced by handlers.
    Poison,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UnsupportedSchema => "unsupported_schema",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::HandlerTimeout => "handler_timeout",
            ErrorKind::PermanentUpstream => "permanent_upstream",
            ErrorKind::Poison => "poison",
            ErrorKind::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::TransientIo
                | ErrorKind::HandlerTimeout
                | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by message handlers.
///
/// This is the narrow adapter seam the design calls for: whatever a handler
/// hits internally (HTTP client errors, upstream SDK failures, panics caught
/// at the boundary), it reaches the worker as one of these.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(String),
    #[error("rate limited by upstream: {0}")]
    RateLimit(String),
    #[error("transient io failure: {0}")]
    TransientIo(String),
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
    #[error("permanent upstream failure: {0}")]
    PermanentUpstream(String),
    #[error("handler failure: {0}")]
    Other(String),
}

impl HandlerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Validation(_) => ErrorKind::Validation,
            HandlerError::UnsupportedSchema(_) => ErrorKind::UnsupportedSchema,
            HandlerError::RateLimit(_) => ErrorKind::RateLimit,
            HandlerError::TransientIo(_) => ErrorKind::TransientIo,
            HandlerError::Timeout(_) => ErrorKind::HandlerTimeout,
            HandlerError::PermanentUpstream(_) => ErrorKind::PermanentUpstream,
            HandlerError::Other(_) => ErrorKind::Unknown,
        }
    }

    #[must_use]
    pub fn retriable(&self) -> bool {
        self.kind().retriable()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_kinds_match_policy_table() {
        assert!(!ErrorKind::Validation.retriable());
        assert!(!ErrorKind::UnsupportedSchema.retriable());
        assert!(!ErrorKind::PermanentUpstream.retriable());
        assert!(!ErrorKind::Poison.retriable());
        assert!(ErrorKind::RateLimit.retriable());
        assert!(ErrorKind::TransientIo.retriable());
        assert!(ErrorKind::HandlerTimeout.retriable());
        assert!(ErrorKind::Unknown.retriable());
    }

    #[test]
    fn test_handler_error_maps_to_kind() {
        assert_eq!(
            HandlerError::RateLimit("429".to_string()).kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            HandlerError::Timeout(Duration::from_secs(30)).kind(),
            ErrorKind::HandlerTimeout
        );
        assert_eq!(
            HandlerError::Other("boom".to_string()).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_value(ErrorKind::TransientIo).unwrap();
        assert_eq!(json, "transient_io");
        let back: ErrorKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, ErrorKind::TransientIo);
    }
}
