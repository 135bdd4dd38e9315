//! The `gai.events.v1` wire schema.
//!
//! A [`NormalizedEvent`] is one frame of a normalized stream. Field order in
//! the struct is the field order on the wire; changing it (or any field name)
//! is a breaking schema change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::events::{Citation, SafetyVerdict, Usage};

pub const SCHEMA_VERSION: &str = "gai.events.v1";

// ============================================================================
// Event type tag
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Start,
    TextDelta,
    AudioDelta,
    ToolCall,
    ToolResult,
    Citations,
    Safety,
    StepFinish,
    Finish,
    Error,
    /// `raw.<kind>` for provider events without a dedicated type.
    Raw(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::TextDelta => "text.delta",
            Self::AudioDelta => "audio.delta",
            Self::ToolCall => "tool.call",
            Self::ToolResult => "tool.result",
            Self::Citations => "citations",
            Self::Safety => "safety",
            Self::StepFinish => "step.finish",
            Self::Finish => "finish",
            Self::Error => "error",
            Self::Raw(tag) => tag,
        }
    }

    pub fn raw(kind: &str) -> Self {
        Self::Raw(format!("raw.{kind}"))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event_type = match s {
            "start" => Self::Start,
            "text.delta" => Self::TextDelta,
            "audio.delta" => Self::AudioDelta,
            "tool.call" => Self::ToolCall,
            "tool.result" => Self::ToolResult,
            "citations" => Self::Citations,
            "safety" => Self::Safety,
            "step.finish" => Self::StepFinish,
            "finish" => Self::Finish,
            "error" => Self::Error,
            other if other.starts_with("raw.") && other.len() > 4 => Self::Raw(other.to_string()),
            other => return Err(SchemaError::UnknownType(other.to_string())),
        };
        Ok(event_type)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Payload records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDescriptor {
    pub format: String,
    /// Base64 (standard alphabet) of the audio bytes.
    pub data: String,
    pub bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// NormalizedEvent
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix milliseconds.
    #[serde(default)]
    pub ts: i64,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub error: Option<ErrorPayload>,
    /// Provider payload of `raw.*` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl NormalizedEvent {
    /// Bare envelope; the normalizer fills in the payload fields.
    pub fn envelope(event_type: EventType, ts: i64, seq: u64) -> Self {
        Self {
            schema: None,
            event_type,
            ts,
            seq,
            trace_id: None,
            request_id: None,
            provider: None,
            model: None,
            text: None,
            audio: None,
            call_id: None,
            name: None,
            input: None,
            output: None,
            citations: None,
            safety: None,
            usage: None,
            finish_reason: None,
            error: None,
            raw: None,
        }
    }

    /// Only `start` frames carry a mandatory schema; other frames are never
    /// checked.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.event_type != EventType::Start {
            return Ok(());
        }
        match self.schema.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            other => Err(SchemaError::UnsupportedSchema(other.map(str::to_string))),
        }
    }

    /// Parses and validates a single JSON frame.
    pub fn parse(json: &str) -> Result<Self, SchemaError> {
        let event: Self = serde_json::from_str(json)?;
        event.validate()?;
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Finish | EventType::Error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported schema {0:?}, expected {SCHEMA_VERSION}")]
    UnsupportedSchema(Option<String>),
    #[error("unknown event type: {0}")]
    UnknownType(String),
}
