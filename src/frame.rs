//! Pieces shared by the SSE and NDJSON writers.

use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, header};
use serde::Serialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::schema::{EventType, NormalizedEvent};

pub const SSE_CONTENT_TYPE: &str = "text/event-stream";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// A record a protocol writer can put on the wire.
pub trait WireFrame: Serialize + Send + 'static {
    /// Complete SSE frame written after the source is exhausted.
    const SSE_TERMINAL: &'static str;
    /// NDJSON line (without newline) written after the source is exhausted.
    const NDJSON_TERMINAL: &'static str;
    /// Whether a finish frame ends an NDJSON stream, carrying the terminal
    /// marker itself.
    const FINISH_IS_TERMINAL: bool;

    /// SSE `event:` name; `None` writes a data-only frame.
    fn event_name(&self) -> Option<&str>;

    /// Replay id for the SSE `id:` line.
    fn sequence(&self) -> Option<u64>;

    fn is_error(&self) -> bool;

    fn is_finish(&self) -> bool;

    /// Server-suggested retry delay carried by error frames.
    fn retry_after_ms(&self) -> Option<u64>;
}

impl WireFrame for NormalizedEvent {
    const SSE_TERMINAL: &'static str = "event: done\ndata: {\"type\":\"done\"}\n\n";
    const NDJSON_TERMINAL: &'static str = r#"{"type":"done","finished":true}"#;
    const FINISH_IS_TERMINAL: bool = true;

    fn event_name(&self) -> Option<&str> {
        Some(self.event_type.as_str())
    }

    fn sequence(&self) -> Option<u64> {
        Some(self.seq)
    }

    fn is_error(&self) -> bool {
        self.event_type == EventType::Error
    }

    fn is_finish(&self) -> bool {
        self.event_type == EventType::Finish
    }

    fn retry_after_ms(&self) -> Option<u64> {
        self.error.as_ref().and_then(|e| e.retry_after_ms)
    }
}

/// Lifecycle of one writer: `Idle → Streaming → (Completing | Aborted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WriterState {
    Idle,
    Streaming,
    Completing,
    Aborted,
}

/// How a stream ended when no transport error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamOutcome {
    /// Source exhausted and the terminal frame was written.
    Completed,
    /// Cancelled (client disconnect or explicit close) before exhaustion.
    Cancelled,
}

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Ticker whose first tick is one full period away.
///
/// Periods below one millisecond are raised to it; `interval_at` panics on
/// zero.
pub(crate) fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn streaming_headers(content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

pub fn sse_headers() -> HeaderMap {
    streaming_headers(SSE_CONTENT_TYPE)
}

/// Chunked transfer encoding is applied by hyper for unsized bodies.
pub fn ndjson_headers() -> HeaderMap {
    streaming_headers(NDJSON_CONTENT_TYPE)
}
