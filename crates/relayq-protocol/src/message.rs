/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Logical priority class P0 (most urgent) through P3.
///
/// The broker queue is declared with ten native levels; logical classes map
/// onto it sparsely so promotions and demotions never collide with a
/// neighboring class. Wire values outside 0..=3 fail deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub struct Priority(u8);

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl Priority {
    pub const P0: Priority = Priority(0);
    pub const P1: Priority = Priority(1);
    pub const P2: Priority = Priority(2);
    pub const P3: Priority = Priority(3);

    /// Construct from a raw value, rejecting anything outside 0..=3.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPriority`] when out of range.
    pub fn new(value: u8) -> Result<Self, ProtocolError> {
        if value > 3 {
            return Err(ProtocolError::InvalidPriority(value));
        }
        Ok(Priority(value))
    }

    /// Parse operator input: `"2"`, `"P2"`, and `"p2"` all mean P2.
    /// Out-of-range digits clamp into 0..=3; anything else defaults to P2.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Priority {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix('P')
            .or_else(|| trimmed.strip_prefix('p'))
            .unwrap_or(trimmed);
        match digits.parse::<i64>() {
            Ok(n) => Priority(n.clamp(0, 3) as u8),
            Err(_) => Priority::P2,
        }
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Map the logical class onto the broker's 0..=9 priority range:
    /// P0 -> 9, P1 -> 6, P2 -> 3, P3 -> 0.
    #[must_use]
    pub fn amqp_priority(self) -> u8 {
        match self.0 {
            0 => 9,
            1 => 6,
            2 => 3,
            _ => 0,
        }
    }

    /// One class less urgent, bounded at P3.
    #[must_use]
    pub fn demoted(self) -> Priority {
        Priority(self.0.saturating_add(1).min(3))
    }

    /// One class more urgent, bounded at P0.
    #[must_use]
    pub fn promoted(self) -> Priority {
        Priority(self.0.saturating_sub(1))
    }

    /// Display label, e.g. `"P1"`.
    #[must_use]
    pub fn label(self) -> String {
        format!("P{}", self.0)
    }
}

/// Who created a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedByKind {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedBy {
    pub kind: CreatedByKind,
    pub id: String,
}

/// Request operation discriminator. Payloads are opaque to the queue and
/// decoded by the handler registered for the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ModelCall,
    ToolCall,
    AgentMessage,
    MemorySave,
    MemoryRetrieve,
    MemoryUpdate,
    AgentSpawn,
    AgentTerminate,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ModelCall => "model_call",
            MessageType::ToolCall => "tool_call",
            MessageType::AgentMessage => "agent_message",
            MessageType::MemorySave => "memory_save",
            MessageType::MemoryRetrieve => "memory_retrieve",
            MessageType::MemoryUpdate => "memory_update",
            MessageType::AgentSpawn => "agent_spawn",
            MessageType::AgentTerminate => "agent_terminate",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical request message placed on an org queue.
///
/// `message_id`, `goal_id`, and `task_id` may be left empty/absent by the
/// caller; [`RequestMessage::stamp`] fills them before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default)]
    pub message_id: String,
    pub schema_version: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub created_by: CreatedBy,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    /// When set at publish time, retries keep their priority instead of
    /// being demoted one class per attempt.
    #[serde(default)]
    pub no_demote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<Value>,
    #[serde(default)]
    pub payload: Value,
}

fn default_max_retries() -> u32 {
    3
}

impl RequestMessage {
    /// Fill in the identifiers the caller is allowed to omit.
    pub fn stamp(&mut self) {
        if self.message_id.is_empty() {
            self.message_id = Uuid::new_v4().to_string();
        }
        if self.goal_id.as_deref().is_none_or(str::is_empty) {
            self.goal_id = Some(Uuid::new_v4().to_string());
        }
        if self.task_id.as_deref().is_none_or(str::is_empty) {
            self.task_id = Some(Uuid::new_v4().to_string());
        }
    }

    /// Validate required fields and the schema window. Expects
    /// [`RequestMessage::stamp`] to have run first for producer-side use.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingField`] for absent required fields and
    /// [`ProtocolError::UnsupportedSchema`] for versions outside the window.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.message_id.is_empty() {
            return Err(ProtocolError::MissingField("message_id"));
        }
        if self.org_id.is_empty() {
            return Err(ProtocolError::MissingField("org_id"));
        }
        if self.created_by.id.is_empty() {
            return Err(ProtocolError::MissingField("created_by.id"));
        }
        if self.goal_id.as_deref().is_none_or(str::is_empty) {
            return Err(ProtocolError::MissingField("goal_id"));
        }
        if self.task_id.as_deref().is_none_or(str::is_empty) {
            return Err(ProtocolError::MissingField("task_id"));
        }
        crate::check_schema_window(&self.schema_version)?;
        Ok(())
    }

    /// Whether the message carried an `expires_at` that has already passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// The key the poison counter and idempotency gate use: the caller's
    /// `dedup_key` when present, the `message_id` otherwise.
    #[must_use]
    pub fn dedup_key_or_id(&self) -> &str {
        self.dedup_key.as_deref().unwrap_or(&self.message_id)
    }
}

/// The header set carried on the broker envelope alongside the JSON body,
/// so routing and retry decisions never require parsing the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub message_id: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub retry_count: u32,
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

impl EnvelopeHeaders {
    #[must_use]
    pub fn from_message(msg: &RequestMessage) -> Self {
        EnvelopeHeaders {
            message_id: msg.message_id.clone(),
            org_id: msg.org_id.clone(),
            agent_id: msg.agent_id.clone(),
            message_type: msg.message_type,
            priority: msg.priority,
            retry_count: msg.retry_count,
            schema_version: msg.schema_version.clone(),
            dedup_key: msg.dedup_key.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_message() -> RequestMessage {
        RequestMessage {
            message_id: String::new(),
            schema_version: crate::SCHEMA_VERSION.to_string(),
            org_id: "acme".to_string(),
            agent_id: Some("agent-1".to_string()),
            user_id: None,
            goal_id: None,
            task_id: None,
            parent_message_id: None,
            created_by: CreatedBy {
                kind: CreatedByKind::System,
                id: "producer".to_string(),
            },
            message_type: MessageType::ModelCall,
            priority: Priority::P2,
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            dedup_key: None,
            no_demote: false,
            context: None,
            resource_limits: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_priority_amqp_mapping() {
        assert_eq!(Priority::P0.amqp_priority(), 9);
        assert_eq!(Priority::P1.amqp_priority(), 6);
        assert_eq!(Priority::P2.amqp_priority(), 3);
        assert_eq!(Priority::P3.amqp_priority(), 0);
    }

    #[test]
    fn test_priority_demote_bounded_at_p3() {
        assert_eq!(Priority::P0.demoted(), Priority::P1);
        assert_eq!(Priority::P2.demoted(), Priority::P3);
        assert_eq!(Priority::P3.demoted(), Priority::P3);
    }

    #[test]
    fn test_priority_promote_bounded_at_p0() {
        assert_eq!(Priority::P3.promoted(), Priority::P2);
        assert_eq!(Priority::P1.promoted(), Priority::P0);
        assert_eq!(Priority::P0.promoted(), Priority::P0);
    }

    #[test]
    fn test_priority_parse_lenient() {
        assert_eq!(Priority::parse_lenient("P0"), Priority::P0);
        assert_eq!(Priority::parse_lenient("p3"), Priority::P3);
        assert_eq!(Priority::parse_lenient("1"), Priority::P1);
        assert_eq!(Priority::parse_lenient("9"), Priority::P3, "clamped");
        assert_eq!(Priority::parse_lenient("garbage"), Priority::P2, "default");
    }

    #[test]
    fn test_priority_rejects_out_of_range() {
        assert!(Priority::new(3).is_ok());
        assert!(Priority::new(4).is_err());
    }

    #[test]
    fn test_priority_wire_range_enforced() {
        assert_eq!(
            serde_json::from_value::<Priority>(serde_json::json!(2)).unwrap(),
            Priority::P2
        );
        assert!(serde_json::from_value::<Priority>(serde_json::json!(7)).is_err());
        assert_eq!(serde_json::to_value(Priority::P1).unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_stamp_fills_missing_identifiers() {
        let mut msg = base_message();
        msg.stamp();
        assert!(!msg.message_id.is_empty());
        assert!(msg.goal_id.is_some());
        assert!(msg.task_id.is_some());
        msg.validate().unwrap();
    }

    #[test]
    fn test_stamp_preserves_existing_identifiers() {
        let mut msg = base_message();
        msg.message_id = "m-1".to_string();
        msg.goal_id = Some("g-1".to_string());
        msg.stamp();
        assert_eq!(msg.message_id, "m-1");
        assert_eq!(msg.goal_id.as_deref(), Some("g-1"));
    }

    #[test]
    fn test_validate_rejects_missing_org() {
        let mut msg = base_message();
        msg.stamp();
        msg.org_id = String::new();
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingField("org_id"))
        ));
    }

    #[test]
    fn test_validate_rejects_unsupported_schema() {
        let mut msg = base_message();
        msg.stamp();
        msg.schema_version = "3.0.0".to_string();
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::UnsupportedSchema(_))
        ));
    }

    #[test]
    fn test_expiry_check() {
        let mut msg = base_message();
        let now = Utc::now();
        assert!(!msg.is_expired(now));
        msg.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(msg.is_expired(now));
        msg.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!msg.is_expired(now));
    }

    #[test]
    fn test_dedup_key_falls_back_to_message_id() {
        let mut msg = base_message();
        msg.stamp();
        assert_eq!(msg.dedup_key_or_id(), msg.message_id);
        msg.dedup_key = Some("k1".to_string());
        assert_eq!(msg.dedup_key_or_id(), "k1");
    }

    #[test]
    fn test_message_round_trips_with_type_tag() {
        let mut msg = base_message();
        msg.stamp();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "model_call");
        assert_eq!(json["priority"], 2);
        let back: RequestMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.message_type, MessageType::ModelCall);
        assert_eq!(back.message_id, msg.message_id);
    }

    #[test]
    fn test_minimal_wire_message_defaults() {
        // Callers may omit retry bookkeeping and optional routing fields.
        let json = serde_json::json!({
            "message_id": "m-7",
            "schema_version": "1.0.0",
            "org_id": "acme",
            "created_by": {"kind": "user", "id": "u-1"},
            "type": "tool_call",
            "priority": 1,
            "created_at": "2026-01-05T10:00:00Z",
            "payload": {"tool": "search"},
        });
        let msg: RequestMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert!(!msg.no_demote);
        assert!(msg.agent_id.is_none());
    }

    #[test]
    fn test_envelope_headers_mirror_message() {
        let mut msg = base_message();
        msg.stamp();
        msg.dedup_key = Some("k1".to_string());
        let headers = EnvelopeHeaders::from_message(&msg);
        assert_eq!(headers.message_id, msg.message_id);
        assert_eq!(headers.priority, Priority::P2);
        assert_eq!(headers.dedup_key.as_deref(), Some("k1"));
        let json = serde_json::to_value(&headers).unwrap();
        assert_eq!(json["type"], "model_call");
    }
}
