//! Server-Sent Events writer.
//!
//! Two loops share one transport: the event loop writes one frame per event
//! and the heartbeat loop writes `: keep-alive` comments on a fixed interval.
//! Every write goes through the same mutex so frames never interleave.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt as _, Stream, StreamExt as _};
use tokio::io::{AsyncWrite, AsyncWriteExt as _, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::frame::{StreamOutcome, WireFrame, WriterState, ticker};

pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseConfig {
    pub heartbeat_interval: Duration,
    pub flush_after_write: bool,
    /// Enables `retry:` hints on error frames, capped at this many ms.
    pub max_retry_ms: Option<u64>,
    pub write_buffer_size: usize,
    /// Emit `id:` lines so clients can resume with `Last-Event-ID`.
    pub replay_ids: bool,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            flush_after_write: true,
            max_retry_ms: None,
            write_buffer_size: 8 * 1024,
            replay_ids: false,
        }
    }
}

type SharedOut<W> = Arc<Mutex<BufWriter<W>>>;

pub struct SseWriter<W> {
    out: SharedOut<W>,
    config: SseConfig,
    state: WriterState,
    frames: u64,
}

impl<W> SseWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(out: W, config: SseConfig) -> Self {
        let out = BufWriter::with_capacity(config.write_buffer_size.max(1), out);
        Self {
            out: Arc::new(Mutex::new(out)),
            config,
            state: WriterState::Idle,
            frames: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Data frames written so far, not counting keep-alives or the terminal
    /// frame.
    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    /// Streams `events` until exhausted, cancelled, or the transport fails.
    ///
    /// On exhaustion the terminal `done` frame is always written. After a
    /// transport failure nothing else is written and the error is returned
    /// for logging. Every write, keep-alives and the terminal frame included,
    /// gives up as soon as `cancel` fires, so a stalled reader cannot pin the
    /// writer.
    pub async fn write_stream<E, S>(
        &mut self,
        mut events: S,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, StreamError>
    where
        E: WireFrame,
        S: Stream<Item = E> + Unpin + Send,
    {
        self.state = WriterState::Streaming;
        // `session` aborts in-flight writes; `stop` only ends the tick loop
        let session = cancel.child_token();
        let stop = session.child_token();
        let heartbeat = spawn_heartbeat(
            self.out.clone(),
            self.config.heartbeat_interval,
            stop.clone(),
            session.clone(),
        );

        let pumped = self.pump(&mut events, &session).await;

        match pumped {
            Ok(StreamOutcome::Completed) => stop.cancel(),
            _ => session.cancel(),
        }
        let heartbeat = match heartbeat.await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("sse heartbeat task failed: {}", err);
                Ok(())
            }
        };

        let outcome = match (pumped, heartbeat) {
            (Err(err), _) | (Ok(_), Err(err)) => {
                self.state = WriterState::Aborted;
                return Err(err);
            }
            (Ok(outcome), Ok(())) => outcome,
        };
        if outcome == StreamOutcome::Cancelled || cancel.is_cancelled() {
            self.state = WriterState::Aborted;
            return Ok(StreamOutcome::Cancelled);
        }

        self.state = WriterState::Completing;
        let terminal = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            written = self.write_raw(E::SSE_TERMINAL.as_bytes(), true) => Some(written),
        };
        match terminal {
            Some(Ok(())) => Ok(StreamOutcome::Completed),
            Some(Err(err)) => {
                self.state = WriterState::Aborted;
                Err(err)
            }
            None => {
                self.state = WriterState::Aborted;
                Ok(StreamOutcome::Cancelled)
            }
        }
    }

    async fn pump<E, S>(
        &mut self,
        events: &mut S,
        session: &CancellationToken,
    ) -> Result<StreamOutcome, StreamError>
    where
        E: WireFrame,
        S: Stream<Item = E> + Unpin + Send,
    {
        let flush_each = self.config.flush_after_write;
        let mut dirty = false;
        loop {
            let next = match events.next().now_or_never() {
                Some(next) => next,
                None => {
                    // unflushed frames must not wait on a slow producer
                    if dirty {
                        tokio::select! {
                            biased;
                            _ = session.cancelled() => return Ok(StreamOutcome::Cancelled),
                            flushed = self.flush() => flushed?,
                        }
                        dirty = false;
                    }
                    tokio::select! {
                        biased;
                        _ = session.cancelled() => return Ok(StreamOutcome::Cancelled),
                        next = events.next() => next,
                    }
                }
            };
            let Some(event) = next else {
                return Ok(StreamOutcome::Completed);
            };
            let frame = self.encode(&event)?;
            tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(StreamOutcome::Cancelled),
                written = self.write_raw(frame.as_bytes(), flush_each) => written?,
            }
            dirty = !flush_each;
            self.frames += 1;
        }
    }

    fn encode<E: WireFrame>(&self, event: &E) -> Result<String, StreamError> {
        let data = serde_json::to_string(event)?;
        let mut frame = String::with_capacity(data.len() + 48);
        if self.config.replay_ids {
            let id = event.sequence().unwrap_or(self.frames + 1);
            let _ = writeln!(frame, "id: {}", id);
        }
        if let Some(name) = event.event_name() {
            let _ = writeln!(frame, "event: {}", name);
        }
        if event.is_error() {
            if let Some(max) = self.config.max_retry_ms {
                let retry = event.retry_after_ms().map_or(max, |ms| ms.min(max));
                let _ = writeln!(frame, "retry: {}", retry);
            }
        }
        let _ = write!(frame, "data: {}\n\n", data);
        Ok(frame)
    }

    async fn write_raw(&self, bytes: &[u8], flush: bool) -> Result<(), StreamError> {
        let mut out = self.out.lock().await;
        out.write_all(bytes).await?;
        if flush {
            out.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StreamError> {
        self.out.lock().await.flush().await?;
        Ok(())
    }
}

/// Writes keep-alives until `stop` fires.
///
/// A write in progress is abandoned only when `session` fires. On failure
/// the session is cancelled so the event loop stops too.
fn spawn_heartbeat<W>(
    out: SharedOut<W>,
    period: Duration,
    stop: CancellationToken,
    session: CancellationToken,
) -> JoinHandle<Result<(), StreamError>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let written = tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(()),
                written = async {
                    let mut guard = out.lock().await;
                    guard.write_all(KEEP_ALIVE_FRAME).await?;
                    guard.flush().await
                } => written,
            };
            if let Err(err) = written {
                session.cancel();
                return Err(StreamError::Heartbeat(err));
            }
            log::debug!("sse keep-alive sent");
        }
    })
}
