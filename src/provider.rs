use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ValidationError, ValidationErrors};
use crate::events::{Event, Usage};
use crate::source::{self, SourceSender, SourceStream};

pub const MAX_MESSAGE_CHARS: usize = 32_000;

// ============================================================================
// REQUEST STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Always `true` once the request has been prepared for streaming.
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl GenerateRequest {
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

pub fn validate_generate_request(request: &GenerateRequest) -> Result<()> {
    let mut errors = ValidationErrors::new();

    if request.model.trim().is_empty() {
        errors.add(ValidationError::new("model", "Model cannot be empty"));
    }

    if request.messages.is_empty() {
        errors.add(ValidationError::new("messages", "At least one message is required"));
    }

    for (i, message) in request.messages.iter().enumerate() {
        if message.content.trim().is_empty() {
            errors.add(ValidationError::new(
                format!("messages[{}].content", i),
                "Message cannot be empty",
            ));
        }
        if message.content.chars().count() > MAX_MESSAGE_CHARS {
            errors.add(
                ValidationError::new(
                    format!("messages[{}].content", i),
                    format!("Message too long (max {} chars)", MAX_MESSAGE_CHARS),
                )
                .with_code("TOO_LONG"),
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into_app_error())
    }
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Opens an upstream generation and exposes it as a [`SourceStream`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name stamped into the `provider` field of start frames.
    fn id(&self) -> &str;

    /// Errors returned here happen before any response bytes and become
    /// HTTP errors.
    async fn open_stream(&self, request: &GenerateRequest) -> Result<Arc<dyn SourceStream>>;
}

/// Streams the last user message back word by word.
pub struct EchoProvider {
    delay: Duration,
    buffer: usize,
}

impl EchoProvider {
    pub fn new(delay: Duration) -> Self {
        Self { delay, buffer: 16 }
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl Provider for EchoProvider {
    fn id(&self) -> &str {
        "echo"
    }

    async fn open_stream(&self, request: &GenerateRequest) -> Result<Arc<dyn SourceStream>> {
        let prompt = request.last_user_message().unwrap_or_default().to_string();
        let input_tokens = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        let (tx, source) = source::channel(self.buffer);
        tokio::spawn(echo(tx, prompt, input_tokens, self.delay));
        Ok(Arc::new(source))
    }
}

async fn echo(tx: SourceSender, prompt: String, input_tokens: u64, delay: Duration) {
    if tx.send(Event::Start).await.is_err() {
        return;
    }

    let words: Vec<&str> = prompt.split_inclusive(' ').collect();
    for word in &words {
        if tx.send(Event::text(*word)).await.is_err() {
            log::debug!("echo source closed by consumer");
            return;
        }
        if !delay.is_zero() {
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    let usage = Usage::new(input_tokens, words.len() as u64);
    let _ = tx.send(Event::finish(Some(usage), Some("stop"))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn request(content: &str) -> GenerateRequest {
        GenerateRequest {
            model: "echo-1".into(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: content.into(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(validate_generate_request(&request("hello")).is_ok());
    }

    #[test]
    fn collects_every_field_error() {
        let mut bad = request("   ");
        bad.model = String::new();
        let err = validate_generate_request(&bad).expect_err("invalid");
        assert_eq!(err.code, ErrorCode::ValidationError);
        let details = err.details.expect("details");
        let fields: Vec<&str> = details["errors"]
            .as_array()
            .expect("errors")
            .iter()
            .filter_map(|e| e["field"].as_str())
            .collect();
        assert_eq!(fields, vec!["model", "messages[0].content"]);
    }

    #[test]
    fn rejects_oversized_messages() {
        let err = validate_generate_request(&request(&"x".repeat(MAX_MESSAGE_CHARS + 1)))
            .expect_err("too long");
        let details = err.details.expect("details");
        assert_eq!(details["errors"][0]["code"], "TOO_LONG");
    }

    #[tokio::test]
    async fn echo_streams_words_then_finish() {
        let provider = EchoProvider::new(Duration::ZERO);
        let source = provider
            .open_stream(&request("The quick fox"))
            .await
            .expect("open");

        let mut kinds = Vec::new();
        let mut text = String::new();
        let mut usage = None;
        while let Some(event) = source.next_event().await {
            kinds.push(event.kind().to_string());
            match event {
                Event::TextDelta { text: t } => text.push_str(&t),
                Event::Finish { usage: u, .. } => usage = u,
                _ => {}
            }
        }
        assert_eq!(
            kinds,
            vec!["start", "text-delta", "text-delta", "text-delta", "finish"]
        );
        assert_eq!(text, "The quick fox");
        assert_eq!(usage, Some(Usage::new(3, 3)));
    }

    #[tokio::test]
    async fn echo_stops_once_closed() {
        let provider = EchoProvider::new(Duration::from_millis(5));
        let source = provider
            .open_stream(&request(&"word ".repeat(1000)))
            .await
            .expect("open");
        assert!(matches!(source.next_event().await, Some(Event::Start)));
        source.close();
        assert!(source.next_event().await.is_none());
    }
}
