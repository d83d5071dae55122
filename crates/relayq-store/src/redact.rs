/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! PII redaction applied to audit records at emission time.
//!
//! Three levels: `none` passes records through untouched, `medium` scrubs
//! configured patterns out of string values, `full` replaces payloads and
//! event details wholesale with a redaction marker (the production posture
//! of the audit trail).

use regex::Regex;
use serde_json::{json, Value};
use tracing::warn;

use crate::AuditRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionLevel {
    None,
    Medium,
    Full,
}

impl RedactionLevel {
    /// Parse the config string; unknown values fall back to `Full` so a
    /// typo in production config cannot silently disable redaction.
    #[must_use]
    pub fn parse(value: &str) -> RedactionLevel {
        match value.to_ascii_lowercase().as_str() {
            "none" => RedactionLevel::None,
            "medium" => RedactionLevel::Medium,
            "full" => RedactionLevel::Full,
            other => {
                warn!(level = other, "unknown redaction level, defaulting to full");
                RedactionLevel::Full
            }
        }
    }
}

const REDACTED_MARKER: &str = "[redacted]";

// Baseline scrub set for medium redaction. Deployments extend it via
// `[audit] redaction_patterns`.
const DEFAULT_PATTERNS: &[&str] = &[
    r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
    r"(?i)bearer\s+[A-Za-z0-9._\-]+",
    r"sk-[A-Za-z0-9]{16,}",
    r"\b\d{3}-\d{2}-\d{4}\b",
];

pub struct Redactor {
    level: RedactionLevel,
    patterns: Vec<Regex>,
}

impl Redactor {
    #[must_use]
    pub fn new(level: RedactionLevel, extra_patterns: &[String]) -> Redactor {
        let mut patterns = Vec::new();
        if level == RedactionLevel::Medium {
            for source in DEFAULT_PATTERNS
                .iter()
                .copied()
                .chain(extra_patterns.iter().map(String::as_str))
            {
                match Regex::new(source) {
                    Ok(re) => patterns.push(re),
                    Err(e) => warn!(pattern = source, error = %e, "skipping invalid redaction pattern"),
                }
            }
        }
        Redactor { level, patterns }
    }

    #[must_use]
    pub fn level(&self) -> RedactionLevel {
        self.level
    }

    /// Apply the configured policy to one audit record in place.
    pub fn apply(&self, record: &mut AuditRecord) {
        match self.level {
            RedactionLevel::None => {}
            RedactionLevel::Medium => match record {
                AuditRecord::Message(m) => self.scrub_value(&mut m.payload),
                AuditRecord::Event(e) => {
                    if let Some(details) = e.details.as_mut() {
                        self.scrub_value(details);
                    }
                }
                AuditRecord::Dlq(d) => {
                    self.scrub_value(&mut d.original_message);
                    self.scrub_value(&mut d.error_history);
                }
            },
            RedactionLevel::Full => match record {
                AuditRecord::Message(m) => m.payload = json!({"redacted": true}),
                AuditRecord::Event(e) => {
                    if e.details.is_some() {
                        e.details = Some(json!({"redacted": true}));
                    }
                }
                AuditRecord::Dlq(d) => {
                    d.original_message = json!({"redacted": true});
                    d.error_history = json!({"redacted": true});
                }
            },
        }
    }

    fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                for re in &self.patterns {
                    if re.is_match(s) {
                        *s = re.replace_all(s, REDACTED_MARKER).into_owned();
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.scrub_value(item);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.scrub_value(item);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{DlqRecord, MessageEventRecord, MessageRecord};

    fn event_with_details(details: Value) -> AuditRecord {
        AuditRecord::Event(MessageEventRecord {
            message_id: Some("m-1".to_string()),
            org_id: "acme".to_string(),
            event_type: "failed".to_string(),
            details: Some(details),
        })
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(RedactionLevel::parse("none"), RedactionLevel::None);
        assert_eq!(RedactionLevel::parse("Medium"), RedactionLevel::Medium);
        assert_eq!(RedactionLevel::parse("FULL"), RedactionLevel::Full);
        assert_eq!(
            RedactionLevel::parse("typo"),
            RedactionLevel::Full,
            "unknown levels fail closed"
        );
    }

    #[test]
    fn test_none_passes_through() {
        let redactor = Redactor::new(RedactionLevel::None, &[]);
        let mut record = event_with_details(json!({"email": "alice@example.com"}));
        redactor.apply(&mut record);
        match record {
            AuditRecord::Event(e) => {
                assert_eq!(e.details.unwrap()["email"], "alice@example.com");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_medium_scrubs_patterns_in_nested_values() {
        let redactor = Redactor::new(RedactionLevel::Medium, &[]);
        let mut record = event_with_details(json!({
            "error": "upstream rejected alice@example.com",
            "nested": {"auth": "Bearer abc.def-123"},
            "list": ["sk-0123456789abcdef0123", "clean"],
        }));
        redactor.apply(&mut record);
        match record {
            AuditRecord::Event(e) => {
                let details = e.details.unwrap();
                assert_eq!(details["error"], "upstream rejected [redacted]");
                assert_eq!(details["nested"]["auth"], "[redacted]");
                assert_eq!(details["list"][0], "[redacted]");
                assert_eq!(details["list"][1], "clean");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_medium_honors_extra_patterns() {
        let redactor =
            Redactor::new(RedactionLevel::Medium, &[r"acct-\d{6}".to_string()]);
        let mut record = event_with_details(json!({"note": "charge acct-123456 now"}));
        redactor.apply(&mut record);
        match record {
            AuditRecord::Event(e) => {
                assert_eq!(e.details.unwrap()["note"], "charge [redacted] now");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_full_replaces_payload_and_details() {
        let redactor = Redactor::new(RedactionLevel::Full, &[]);

        let mut message = AuditRecord::Message(MessageRecord {
            message_id: "m-1".to_string(),
            org_id: "acme".to_string(),
            agent_id: None,
            message_type: None,
            priority: None,
            status: "QUEUED".to_string(),
            payload: json!({"ssn": "123-45-6789"}),
        });
        redactor.apply(&mut message);
        match message {
            AuditRecord::Message(m) => assert_eq!(m.payload, json!({"redacted": true})),
            _ => unreachable!(),
        }

        let mut dlq = AuditRecord::Dlq(DlqRecord {
            org_id: "acme".to_string(),
            original_message: json!({"secret": true}),
            error_history: json!([{"detail": "boom"}]),
            can_replay: true,
        });
        redactor.apply(&mut dlq);
        match dlq {
            AuditRecord::Dlq(d) => {
                assert_eq!(d.original_message, json!({"redacted": true}));
                assert_eq!(d.error_history, json!({"redacted": true}));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_full_leaves_absent_details_absent() {
        let redactor = Redactor::new(RedactionLevel::Full, &[]);
        let mut record = AuditRecord::Event(MessageEventRecord {
            message_id: None,
            org_id: "acme".to_string(),
            event_type: "enqueued".to_string(),
            details: None,
        });
        redactor.apply(&mut record);
        match record {
            AuditRecord::Event(e) => assert!(e.details.is_none()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invalid_extra_pattern_is_skipped() {
        // Must not panic; the bad pattern is dropped with a warning.
        let redactor = Redactor::new(RedactionLevel::Medium, &["([unclosed".to_string()]);
        let mut record = event_with_details(json!({"email": "bob@example.com"}));
        redactor.apply(&mut record);
        match record {
            AuditRecord::Event(e) => {
                assert_eq!(e.details.unwrap()["email"], "[redacted]");
            }
            _ => unreachable!(),
        }
    }
}
