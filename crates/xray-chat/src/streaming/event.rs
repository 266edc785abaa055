//! Stream events and their SSE encoding.
//!
//! One frame per event:
//!
//! ```text
//! event: content_block_delta
//! data: {"delta":{"text":"Xin","type":"text_delta"},"index":0,"type":"content_block_delta"}
//!
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    MessageStart,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Ping,
    Error,
}

impl StreamEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::ContentBlockStart => "content_block_start",
            Self::ContentBlockDelta => "content_block_delta",
            Self::ContentBlockStop => "content_block_stop",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Ping => "ping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Thinking,
    ToolUse,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
        }
    }
}

/// Kind of a content delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    TextDelta,
    ThinkingDelta,
    ToolStatus,
    /// JSON-encoded detection list.
    DetectionsDelta,
}

impl DeltaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextDelta => "text_delta",
            Self::ThinkingDelta => "thinking_delta",
            Self::ToolStatus => "tool_status",
            Self::DetectionsDelta => "detections_delta",
        }
    }
}

/// One event of a streamed message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub event_type: StreamEventType,
    pub data: Map<String, Value>,
}

impl StreamEvent {
    /// Build an event from a JSON object payload; other values become an
    /// empty payload.
    pub fn new(event_type: StreamEventType, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { event_type, data }
    }

    pub fn is_ping(&self) -> bool {
        self.event_type == StreamEventType::Ping
    }

    /// Payload plus the `type` field.
    pub fn to_json(&self) -> Value {
        let mut body = self.data.clone();
        body.insert(
            "type".to_string(),
            Value::String(self.event_type.as_str().to_string()),
        );
        Value::Object(body)
    }

    /// `event: <type>\ndata: <json>\n\n`. Non-ASCII text is written as-is.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_type, self.to_json())
    }
}
