/*
 * Relayq - Priority message bus for multi-agent AI platforms
 * Copyright (C) 2025–2026 Relayq Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::message::{Priority, RequestMessage};

/// Error payload surfaced to the originating agent verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub detail: String,
    pub retriable: bool,
}

/// Type-specific body of a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Result {
        data: Value,
    },
    StreamChunk {
        chunk: Value,
        chunk_index: u32,
    },
    StreamComplete {
        total_chunks: u32,
    },
    Error {
        error: ErrorDetail,
    },
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Acknowledgment {
        stage: String,
    },
}

impl ResponseBody {
    /// Terminal frames end a request's response sequence: exactly one of
    /// `result` / `stream_complete` on success, exactly one `error` on
    /// failure.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponseBody::Result { .. }
                | ResponseBody::StreamComplete { .. }
                | ResponseBody::Error { .. }
        )
    }

    /// Label used for metrics and logs.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            ResponseBody::Result { .. } => "result",
            ResponseBody::StreamChunk { .. } => "stream_chunk",
            ResponseBody::StreamComplete { .. } => "stream_complete",
            ResponseBody::Error { .. } => "error",
            ResponseBody::Progress { .. } => "progress",
            ResponseBody::Acknowledgment { .. } => "acknowledgment",
        }
    }
}

/// A single frame on an agent's response queue.
///
/// `priority` mirrors the originating request so the coordinator's overflow
/// policy can spare P0 frames when a mailbox fills up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    fn frame(request: &RequestMessage, agent_id: &str, body: ResponseBody) -> Response {
        Response {
            request_id: request.message_id.clone(),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            priority: Some(request.priority),
            body,
        }
    }

    #[must_use]
    pub fn acknowledgment(request: &RequestMessage, agent_id: &str, stage: &str) -> Response {
        Response::frame(
            request,
            agent_id,
            ResponseBody::Acknowledgment {
                stage: stage.to_string(),
            },
        )
    }

    #[must_use]
    pub fn progress(
        request: &RequestMessage,
        agent_id: &str,
        percent: Option<u8>,
        note: Option<&str>,
    ) -> Response {
        Response::frame(
            request,
            agent_id,
            ResponseBody::Progress {
                percent,
                note: note.map(str::to_string),
            },
        )
    }

    #[must_use]
    pub fn stream_chunk(
        request: &RequestMessage,
        agent_id: &str,
        chunk: Value,
        chunk_index: u32,
    ) -> Response {
        Response::frame(
            request,
            agent_id,
            ResponseBody::StreamChunk { chunk, chunk_index },
        )
    }

    #[must_use]
    pub fn stream_complete(
        request: &RequestMessage,
        agent_id: &str,
        total_chunks: u32,
    ) -> Response {
        Response::frame(request, agent_id, ResponseBody::StreamComplete { total_chunks })
    }

    #[must_use]
    pub fn result(request: &RequestMessage, agent_id: &str, data: Value) -> Response {
        Response::frame(request, agent_id, ResponseBody::Result { data })
    }

    #[must_use]
    pub fn error(
        request: &RequestMessage,
        agent_id: &str,
        kind: ErrorKind,
        detail: &str,
    ) -> Response {
        Response::frame(
            request,
            agent_id,
            ResponseBody::Error {
                error: ErrorDetail {
                    kind,
                    detail: detail.to_string(),
                    retriable: kind.retriable(),
                },
            },
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::{CreatedBy, CreatedByKind, MessageType};

    fn request() -> RequestMessage {
        let mut msg = RequestMessage {
            message_id: "m-1".to_string(),
            schema_version: crate::SCHEMA_VERSION.to_string(),
            org_id: "acme".to_string(),
            agent_id: Some("agent-1".to_string()),
            user_id: None,
            goal_id: Some("g".to_string()),
            task_id: Some("t".to_string()),
            parent_message_id: None,
            created_by: CreatedBy {
                kind: CreatedByKind::Agent,
                id: "agent-1".to_string(),
            },
            message_type: MessageType::ModelCall,
            priority: Priority::P1,
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            dedup_key: None,
            no_demote: false,
            context: None,
            resource_limits: None,
            payload: serde_json::json!({}),
        };
        msg.stamp();
        msg
    }

    #[test]
    fn test_response_wire_shape() {
        let resp = Response::stream_chunk(&request(), "agent-1", serde_json::json!("hi"), 0);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "stream_chunk");
        assert_eq!(json["request_id"], "m-1");
        assert_eq!(json["agent_id"], "agent-1");
        assert_eq!(json["chunk"], "hi");
        assert_eq!(json["chunk_index"], 0);
        assert_eq!(json["priority"], 1);
    }

    #[test]
    fn test_terminal_frames() {
        let req = request();
        assert!(Response::result(&req, "a", serde_json::json!({})).body.is_terminal());
        assert!(Response::stream_complete(&req, "a", 3).body.is_terminal());
        assert!(Response::error(&req, "a", ErrorKind::Unknown, "boom")
            .body
            .is_terminal());
        assert!(!Response::acknowledgment(&req, "a", "processing")
            .body
            .is_terminal());
        assert!(!Response::progress(&req, "a", Some(40), None).body.is_terminal());
        assert!(!Response::stream_chunk(&req, "a", serde_json::json!(1), 0)
            .body
            .is_terminal());
    }

    #[test]
    fn test_error_frame_carries_taxonomy() {
        let resp = Response::error(&request(), "agent-1", ErrorKind::RateLimit, "429 from upstream");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["kind"], "rate_limit");
        assert_eq!(json["error"]["retriable"], true);
        let back: Response = serde_json::from_value(json).unwrap();
        match back.body {
            ResponseBody::Error { error } => {
                assert_eq!(error.kind, ErrorKind::RateLimit);
                assert!(error.retriable);
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_omits_empty_fields() {
        let resp = Response::progress(&request(), "agent-1", None, Some("dropped"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("percent").is_none());
        assert_eq!(json["note"], "dropped");
    }

    #[test]
    fn test_acknowledgment_round_trip() {
        let resp = Response::acknowledgment(&request(), "agent-1", "processing");
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body.kind_label(), "acknowledgment");
        assert_eq!(back, resp);
    }
}
