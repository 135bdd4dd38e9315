use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::events::{Event, SourceError};
use crate::schema::{AudioDescriptor, ErrorPayload, EventType, NormalizedEvent, SCHEMA_VERSION};

/// Code used for errors that carry no structured domain information.
pub const INTERNAL_ERROR_CODE: &str = "internal";

/// Fixed per-stream metadata stamped onto normalized events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub provider: String,
    pub model: String,
}

impl StreamMetadata {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Maps source events onto `gai.events.v1` frames, one frame per event.
///
/// Owns the stream's sequence counter: the first frame gets `seq = 1` and
/// every following frame the next integer, in call order.
pub struct Normalizer {
    meta: StreamMetadata,
    seq: AtomicU64,
    compact: bool,
    clock: fn() -> i64,
}

impl Normalizer {
    pub fn new(meta: StreamMetadata) -> Self {
        Self {
            meta,
            seq: AtomicU64::new(0),
            compact: true,
            clock: now_millis,
        }
    }

    /// With `compact` off every frame carries `schema`, and finish frames
    /// repeat provider and model.
    pub fn compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    pub fn metadata(&self) -> &StreamMetadata {
        &self.meta
    }

    /// Number of frames produced so far.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn normalize(&self, event: Event) -> NormalizedEvent {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        let event_type = event_type_of(&event);
        let mut out = NormalizedEvent::envelope(event_type, (self.clock)(), seq);
        out.request_id = self.meta.request_id.clone();
        out.trace_id = self.meta.trace_id.clone();

        let is_start = matches!(event, Event::Start);
        if is_start || !self.compact {
            out.schema = Some(SCHEMA_VERSION.to_string());
        }
        if is_start || (!self.compact && matches!(event, Event::Finish { .. })) {
            out.provider = Some(self.meta.provider.clone());
            out.model = Some(self.meta.model.clone());
        }

        match event {
            Event::Start => {}
            Event::TextDelta { text } => out.text = Some(text),
            Event::AudioDelta {
                format,
                data,
                transcript,
            } => {
                out.audio = Some(AudioDescriptor {
                    format,
                    bytes: data.len(),
                    data: STANDARD.encode(&data),
                    transcript,
                });
            }
            Event::ToolCall {
                call_id,
                name,
                input,
            } => {
                out.call_id = Some(call_id);
                out.name = Some(name);
                out.input = Some(input);
            }
            Event::ToolResult { call_id, output } => {
                out.call_id = Some(call_id);
                out.output = Some(output);
            }
            Event::Citations { citations } => out.citations = Some(citations),
            Event::Safety { verdict } => out.safety = Some(verdict),
            Event::StepFinish {
                usage,
                finish_reason,
            }
            | Event::Finish {
                usage,
                finish_reason,
            } => {
                out.usage = usage;
                out.finish_reason = finish_reason;
            }
            Event::Error(error) => out.error = Some(error_payload(error)),
            Event::Raw { payload, .. } => out.raw = Some(payload),
        }
        out
    }
}

fn event_type_of(event: &Event) -> EventType {
    match event {
        Event::Start => EventType::Start,
        Event::TextDelta { .. } => EventType::TextDelta,
        Event::AudioDelta { .. } => EventType::AudioDelta,
        Event::ToolCall { .. } => EventType::ToolCall,
        Event::ToolResult { .. } => EventType::ToolResult,
        Event::Citations { .. } => EventType::Citations,
        Event::Safety { .. } => EventType::Safety,
        Event::StepFinish { .. } => EventType::StepFinish,
        Event::Finish { .. } => EventType::Finish,
        Event::Error(_) => EventType::Error,
        Event::Raw { kind, .. } => EventType::raw(kind),
    }
}

fn error_payload(error: SourceError) -> ErrorPayload {
    match error {
        SourceError::Domain(domain) => ErrorPayload {
            code: domain.code,
            message: domain.message,
            retryable: domain.retryable,
            retry_after_ms: domain
                .retry_after
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        },
        SourceError::Other(err) => ErrorPayload {
            code: INTERNAL_ERROR_CODE.to_string(),
            message: err.to_string(),
            retryable: false,
            retry_after_ms: None,
        },
    }
}
