//! Vendor-compatible chat-completion chunks.
//!
//! ```text
//! data: {"id":"chatcmpl-…","object":"chat.completion.chunk","created":1700000000,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}
//!
//! data: [DONE]
//! ```

use serde::{Deserialize, Serialize};

use crate::events::{Event, Usage};
use crate::frame::WireFrame;

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

/// Finish reasons the vendor format knows, keyed by what sources report.
static FINISH_REASONS: &[(&str, &str)] = &[
    ("stop", "stop"),
    ("end_turn", "stop"),
    ("stop_sequence", "stop"),
    ("length", "length"),
    ("max_tokens", "length"),
    ("tool_calls", "tool_calls"),
    ("tool_use", "tool_calls"),
    ("content_filter", "content_filter"),
    ("safety", "content_filter"),
];

/// Maps a source finish reason onto its vendor name; unknown reasons pass
/// through and a missing one becomes `stop`.
pub fn vendor_finish_reason(reason: Option<&str>) -> String {
    let Some(reason) = reason else {
        return "stop".to_string();
    };
    FINISH_REASONS
        .iter()
        .find(|(from, _)| *from == reason)
        .map_or(reason, |&(_, to)| to)
        .to_string()
}

// ============================================================================
// Chunk records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    /// Serialized as `null` until the terminal chunk.
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    pub name: String,
    /// JSON-encoded arguments, as vendors send them.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<Usage> for ChunkUsage {
    fn from(usage: Usage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

impl WireFrame for PassthroughChunk {
    const SSE_TERMINAL: &'static str = "data: [DONE]\n\n";
    const NDJSON_TERMINAL: &'static str = r#"{"object":"done"}"#;
    const FINISH_IS_TERMINAL: bool = false;

    fn event_name(&self) -> Option<&str> {
        None
    }

    fn sequence(&self) -> Option<u64> {
        None
    }

    fn is_error(&self) -> bool {
        false
    }

    fn is_finish(&self) -> bool {
        self.choices.iter().any(|c| c.finish_reason.is_some())
    }

    fn retry_after_ms(&self) -> Option<u64> {
        None
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Turns source events into vendor chunks for one response.
#[derive(Debug)]
pub struct PassthroughConverter {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    next_tool_index: u32,
    dropped: u64,
}

impl PassthroughConverter {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_id(
            format!("chatcmpl-{}", uuid::Uuid::now_v7().simple()),
            model,
        )
    }

    pub fn with_id(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            next_tool_index: 0,
            dropped: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Events that had no vendor counterpart.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Text, tool calls and finish produce a chunk; everything else is
    /// skipped.
    pub fn convert(&mut self, event: &Event) -> Option<PassthroughChunk> {
        match event {
            Event::TextDelta { text } => {
                let role = self.take_role();
                Some(self.chunk(
                    ChunkDelta {
                        role,
                        content: Some(text.clone()),
                        tool_calls: None,
                    },
                    None,
                    None,
                ))
            }
            Event::ToolCall {
                call_id,
                name,
                input,
            } => {
                let role = self.take_role();
                let index = self.next_tool_index;
                self.next_tool_index += 1;
                let call = ToolCallDelta {
                    index,
                    id: call_id.clone(),
                    kind: "function".to_string(),
                    function: FunctionDelta {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                };
                Some(self.chunk(
                    ChunkDelta {
                        role,
                        content: None,
                        tool_calls: Some(vec![call]),
                    },
                    None,
                    None,
                ))
            }
            Event::Finish {
                usage,
                finish_reason,
            } => Some(self.chunk(
                ChunkDelta::default(),
                Some(vendor_finish_reason(finish_reason.as_deref())),
                usage.map(ChunkUsage::from),
            )),
            other => {
                self.dropped += 1;
                log::debug!("passthrough skipped {} event", other.kind());
                None
            }
        }
    }

    fn take_role(&mut self) -> Option<String> {
        if self.role_sent {
            return None;
        }
        self.role_sent = true;
        Some("assistant".to_string())
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<ChunkUsage>,
    ) -> PassthroughChunk {
        PassthroughChunk {
            id: self.id.clone(),
            object: CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DomainError, SafetyVerdict};
    use serde_json::json;

    fn converter() -> PassthroughConverter {
        let mut converter = PassthroughConverter::with_id("chatcmpl-test", "gpt-4o");
        converter.created = 1_700_000_000;
        converter
    }

    #[test]
    fn text_chunks_match_vendor_shape() {
        let mut converter = converter();
        let first = converter.convert(&Event::text("Hel")).expect("chunk");
        let second = converter.convert(&Event::text("lo")).expect("chunk");

        assert_eq!(
            serde_json::to_string(&first).expect("encode"),
            r#"{"id":"chatcmpl-test","object":"chat.completion.chunk","created":1700000000,"model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#
        );
        assert_eq!(second.choices[0].delta.role, None);
        assert_eq!(second.choices[0].delta.content.as_deref(), Some("lo"));
    }

    #[test]
    fn tool_calls_get_increasing_indexes() {
        let mut converter = converter();
        let call = |id: &str| Event::ToolCall {
            call_id: id.to_string(),
            name: "lookup".to_string(),
            input: json!({"q": "rust"}),
        };
        let first = converter.convert(&call("call_1")).expect("chunk");
        let second = converter.convert(&call("call_2")).expect("chunk");

        let value = serde_json::to_value(&second).expect("encode");
        assert_eq!(
            value["choices"][0]["delta"]["tool_calls"][0],
            json!({
                "index": 1,
                "id": "call_2",
                "type": "function",
                "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
            })
        );
        let first_calls = first.choices[0].delta.tool_calls.as_ref().expect("calls");
        assert_eq!(first_calls[0].index, 0);
    }

    #[test]
    fn finish_carries_reason_and_usage() {
        let mut converter = converter();
        let chunk = converter
            .convert(&Event::finish(Some(Usage::new(5, 7)), Some("end_turn")))
            .expect("chunk");
        assert!(chunk.is_finish());
        let value = serde_json::to_value(&chunk).expect("encode");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["choices"][0]["delta"], json!({}));
        assert_eq!(
            value["usage"],
            json!({"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12})
        );
    }

    #[test]
    fn other_events_are_skipped_and_counted() {
        let mut converter = converter();
        assert!(converter.convert(&Event::Start).is_none());
        assert!(
            converter
                .convert(&Event::Safety {
                    verdict: SafetyVerdict {
                        category: "violence".into(),
                        blocked: false,
                        score: None,
                    },
                })
                .is_none()
        );
        assert!(
            converter
                .convert(&Event::error(DomainError::new("x", "y")))
                .is_none()
        );
        assert_eq!(converter.dropped(), 3);
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(vendor_finish_reason(Some("max_tokens")), "length");
        assert_eq!(vendor_finish_reason(Some("tool_use")), "tool_calls");
        assert_eq!(vendor_finish_reason(Some("safety")), "content_filter");
        assert_eq!(vendor_finish_reason(Some("custom")), "custom");
        assert_eq!(vendor_finish_reason(None), "stop");
    }

    #[test]
    fn generated_ids_use_vendor_prefix() {
        let converter = PassthroughConverter::new("m");
        assert!(converter.id().starts_with("chatcmpl-"));
        assert_eq!(converter.id().len(), "chatcmpl-".len() + 32);
    }
}
