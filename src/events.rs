//! Source-side generation events as produced by a provider.
//!
//! Each variant carries only the fields relevant to its kind. Events are
//! moved into the normalizer (or passthrough converter) on receipt.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug)]
pub enum Event {
    // Lifecycle events
    Start,
    StepFinish {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },
    Finish {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    // Content generation events
    TextDelta {
        text: String,
    },
    AudioDelta {
        format: String,
        data: Bytes,
        transcript: Option<String>,
    },

    // Tool events
    ToolCall {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: serde_json::Value,
    },

    // Annotations
    Citations {
        citations: Vec<Citation>,
    },
    Safety {
        verdict: SafetyVerdict,
    },

    // Error events
    Error(SourceError),

    /// Provider-specific event with no dedicated kind.
    Raw {
        kind: String,
        payload: serde_json::Value,
    },
}

impl Event {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn finish(usage: Option<Usage>, finish_reason: Option<&str>) -> Self {
        Self::Finish {
            usage,
            finish_reason: finish_reason.map(str::to_string),
        }
    }

    pub fn error(error: impl Into<SourceError>) -> Self {
        Self::Error(error.into())
    }

    /// Short kind name used in log lines.
    pub fn kind(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::StepFinish { .. } => "step-finish",
            Self::Finish { .. } => "finish",
            Self::TextDelta { .. } => "text-delta",
            Self::AudioDelta { .. } => "audio-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Citations { .. } => "citations",
            Self::Safety { .. } => "safety",
            Self::Error(_) => "error",
            Self::Raw { kind, .. } => kind,
        }
    }
}

// ============================================================================
// Payload records
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub category: String,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

// ============================================================================
// Errors raised by the provider mid-stream
// ============================================================================

/// Structured provider error with a stable code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct DomainError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl DomainError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn retryable(mut self, retry_after: Option<Duration>) -> Self {
        self.retryable = true;
        self.retry_after = retry_after;
        self
    }
}

impl From<AppError> for DomainError {
    fn from(err: AppError) -> Self {
        Self {
            code: err.code.to_string().to_lowercase(),
            retryable: err.code.is_retryable(),
            message: err.message,
            retry_after: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error(transparent)]
    Domain(DomainError),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SourceError {
    pub fn other(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Other(message.into())
    }
}

impl From<DomainError> for SourceError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
