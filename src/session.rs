//! One client stream: source, optional normalization, protocol writer.

use std::sync::Arc;

use axum::http::HeaderMap;
use futures::Stream;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::frame::{self, StreamOutcome, WireFrame};
use crate::ndjson::NdjsonWriter;
use crate::normalizer::{Normalizer, StreamMetadata};
use crate::passthrough::PassthroughConverter;
use crate::pipeline::NormalizedPipeline;
use crate::source::SourceStream;
use crate::sse::SseWriter;
use crate::state::StreamSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Transport {
    Sse,
    Ndjson,
}

impl Transport {
    pub fn headers(&self) -> HeaderMap {
        match self {
            Self::Sse => frame::sse_headers(),
            Self::Ndjson => frame::ndjson_headers(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StreamMode {
    /// `gai.events.v1` frames.
    Normalized,
    /// Vendor chat-completion chunks.
    Passthrough,
}

pub struct StreamSession {
    pub mode: StreamMode,
    pub transport: Transport,
    pub metadata: StreamMetadata,
    source: Arc<dyn SourceStream>,
    settings: StreamSettings,
    cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(
        mode: StreamMode,
        transport: Transport,
        metadata: StreamMetadata,
        source: Arc<dyn SourceStream>,
        settings: StreamSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mode,
            transport,
            metadata,
            source,
            settings,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Buffer size for the pipe between the writer and the response body.
    pub fn write_buffer_size(&self) -> usize {
        match self.transport {
            Transport::Sse => self.settings.sse.write_buffer_size,
            Transport::Ndjson => self.settings.ndjson.write_buffer_size,
        }
    }

    /// Streams the whole session into `out`.
    ///
    /// The source is closed once writing stops, however it stopped.
    pub async fn run<W>(self, out: W) -> Result<StreamOutcome, StreamError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        log::info!(
            "stream started: request_id={:?} mode={} transport={}",
            self.metadata.request_id,
            self.mode,
            self.transport
        );

        let result = match self.mode {
            StreamMode::Normalized => self.run_normalized(out).await,
            StreamMode::Passthrough => self.run_passthrough(out).await,
        };

        match &result {
            Ok(StreamOutcome::Completed) => log::info!(
                "stream completed: request_id={:?}",
                self.metadata.request_id
            ),
            Ok(StreamOutcome::Cancelled) => log::debug!(
                "stream cancelled: request_id={:?}",
                self.metadata.request_id
            ),
            Err(err) if err.is_disconnect() => log::debug!(
                "client went away: request_id={:?}: {}",
                self.metadata.request_id,
                err
            ),
            Err(err) => log::warn!(
                "stream write failed: request_id={:?}: {}",
                self.metadata.request_id,
                err
            ),
        }
        result
    }

    async fn run_normalized<W>(&self, out: W) -> Result<StreamOutcome, StreamError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let normalizer = Normalizer::new(self.metadata.clone()).compact(self.settings.compact);
        let (mut pipeline, rx) = NormalizedPipeline::start(
            self.source.clone(),
            normalizer,
            self.settings.queue_capacity,
            &self.cancel,
        );

        let result = self.write(out, rx.into_stream()).await;

        pipeline.close();
        let forwarded = pipeline.join().await;
        log::debug!(
            "normalized {} events for request_id={:?}",
            forwarded,
            self.metadata.request_id
        );
        result
    }

    async fn run_passthrough<W>(&self, out: W) -> Result<StreamOutcome, StreamError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let source = self.source.clone();
        let mut converter = PassthroughConverter::new(self.metadata.model.clone());
        let chunks = async_stream::stream! {
            while let Some(event) = source.next_event().await {
                if let Some(chunk) = converter.convert(&event) {
                    yield chunk;
                }
            }
            if converter.dropped() > 0 {
                log::debug!("passthrough dropped {} events", converter.dropped());
            }
        };

        let result = self.write(out, Box::pin(chunks)).await;
        self.source.close();
        result
    }

    async fn write<W, E, S>(&self, out: W, events: S) -> Result<StreamOutcome, StreamError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        E: WireFrame,
        S: Stream<Item = E> + Unpin + Send,
    {
        let cancel = self.cancel.clone();
        match self.transport {
            Transport::Sse => {
                SseWriter::new(out, self.settings.sse.clone())
                    .write_stream(events, cancel)
                    .await
            }
            Transport::Ndjson => {
                NdjsonWriter::new(out, self.settings.ndjson.clone())
                    .write_stream(events, cancel)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, Usage};
    use crate::schema::NormalizedEvent;
    use crate::source::{ChannelSource, channel};
    use std::time::Duration;
    use tokio::io::AsyncReadExt as _;
    use tokio::time::timeout;

    fn session(
        mode: StreamMode,
        transport: Transport,
        source: Arc<ChannelSource>,
        settings: StreamSettings,
    ) -> StreamSession {
        StreamSession::new(
            mode,
            transport,
            StreamMetadata::new("test", "model-a").with_request_id("req-1"),
            source,
            settings,
            CancellationToken::new(),
        )
    }

    async fn feed(events: Vec<Event>) -> Arc<ChannelSource> {
        let (tx, source) = channel(events.len().max(1));
        for event in events {
            tx.send(event).await.expect("send");
        }
        Arc::new(source)
    }

    async fn collect(session: StreamSession) -> (StreamOutcome, String) {
        let (tx, mut rx) = tokio::io::duplex(1024);
        let run = tokio::spawn(session.run(tx));
        let mut body = String::new();
        rx.read_to_string(&mut body).await.expect("read");
        let outcome = run.await.expect("join").expect("stream");
        (outcome, body)
    }

    fn sample() -> Vec<Event> {
        vec![
            Event::Start,
            Event::text("Hello "),
            Event::text("world"),
            Event::finish(Some(Usage::new(2, 2)), Some("end_turn")),
        ]
    }

    #[tokio::test]
    async fn normalized_sse_closes_source_after_completion() {
        let source = feed(sample()).await;
        let session = session(
            StreamMode::Normalized,
            Transport::Sse,
            source.clone(),
            StreamSettings::default(),
        );
        let (outcome, body) = collect(session).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        let seqs: Vec<u64> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .filter_map(|d| NormalizedEvent::parse(d).ok())
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(body.ends_with("event: done\ndata: {\"type\":\"done\"}\n\n"));
        assert_eq!(source.close_calls(), 1);
    }

    #[tokio::test]
    async fn passthrough_ndjson_ends_with_vendor_marker() {
        let source = feed(sample()).await;
        let session = session(
            StreamMode::Passthrough,
            Transport::Ndjson,
            source.clone(),
            StreamSettings::default(),
        );
        let (outcome, body) = collect(session).await;

        assert_eq!(outcome, StreamOutcome::Completed);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains(r#""object":"chat.completion.chunk""#));
        assert!(lines[2].contains(r#""finish_reason":"stop""#));
        assert_eq!(lines[3], r#"{"object":"done"}"#);
        assert!(!body.contains("\"seq\""));
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn passthrough_sse_uses_done_sentinel() {
        let source = feed(sample()).await;
        let session = session(
            StreamMode::Passthrough,
            Transport::Sse,
            source,
            StreamSettings::default(),
        );
        let (_, body) = collect(session).await;
        assert!(body.starts_with("data: {\"id\":\"chatcmpl-"));
        assert!(!body.contains("event:"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn disconnect_closes_source() {
        let (_tx, source) = channel(4);
        let source = Arc::new(source);
        let mut settings = StreamSettings::default();
        settings.sse.heartbeat_interval = Duration::from_millis(10);
        let session = session(StreamMode::Normalized, Transport::Sse, source.clone(), settings);

        let (tx, rx) = tokio::io::duplex(64);
        let run = tokio::spawn(session.run(tx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(rx);

        let result = timeout(Duration::from_millis(500), run)
            .await
            .expect("session ends")
            .expect("join");
        assert!(result.expect_err("write fails").is_disconnect());
        assert_eq!(source.close_calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_ends_session_and_closes_source() {
        let (_tx, source) = channel(4);
        let source = Arc::new(source);
        let session = session(
            StreamMode::Normalized,
            Transport::Ndjson,
            source.clone(),
            StreamSettings::default(),
        );
        let cancel = session.cancel_token().clone();

        let (tx, _rx) = tokio::io::duplex(64);
        let run = tokio::spawn(session.run(tx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = timeout(Duration::from_millis(500), run)
            .await
            .expect("session ends")
            .expect("join")
            .expect("no transport error");
        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert!(source.is_closed());
    }

    #[test]
    fn transport_picks_headers() {
        let headers = Transport::Ndjson.headers();
        assert_eq!(headers["content-type"], "application/x-ndjson");
        assert_eq!(Transport::Sse.to_string(), "sse");
        assert_eq!(StreamMode::Passthrough.to_string(), "passthrough");
    }
}
