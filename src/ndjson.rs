//! Newline-delimited JSON writer.

use std::time::Duration;

use futures::{Stream, StreamExt as _};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt as _, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::frame::{StreamOutcome, WireFrame, WriterState, ticker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdjsonConfig {
    pub write_buffer_size: usize,
    /// Upper bound on how long written bytes may sit in the buffer.
    pub flush_interval: Duration,
    /// Indented output; lines then span several physical lines.
    pub pretty: bool,
    pub include_timestamps: bool,
}

impl Default for NdjsonConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 8 * 1024,
            flush_interval: Duration::from_millis(100),
            pretty: false,
            include_timestamps: true,
        }
    }
}

pub struct NdjsonWriter<W> {
    out: BufWriter<W>,
    config: NdjsonConfig,
    state: WriterState,
    lines: u64,
}

impl<W> NdjsonWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W, config: NdjsonConfig) -> Self {
        Self {
            out: BufWriter::with_capacity(config.write_buffer_size.max(1), out),
            config,
            state: WriterState::Idle,
            lines: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Event lines written so far, excluding a standalone terminal line.
    pub fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Streams `events` as one JSON object per line.
    ///
    /// For frame types whose finish is terminal, the finish line carries
    /// `"finished":true` and ends the stream; anything after it is not
    /// written. Otherwise the terminal line follows source exhaustion.
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
        let result = self.pump(&mut events, &cancel).await;
        self.state = match result {
            Ok(StreamOutcome::Completed) => WriterState::Completing,
            _ => WriterState::Aborted,
        };
        result
    }

    async fn pump<E, S>(
        &mut self,
        events: &mut S,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, StreamError>
    where
        E: WireFrame,
        S: Stream<Item = E> + Unpin + Send,
    {
        let mut ticker = ticker(self.config.flush_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                        flushed = self.out.flush() => flushed?,
                    }
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    let terminal = E::FINISH_IS_TERMINAL && event.is_finish();
                    if terminal {
                        self.state = WriterState::Completing;
                    }
                    if !self.emit(&event, terminal, cancel).await? {
                        return Ok(StreamOutcome::Cancelled);
                    }
                    if terminal {
                        return Ok(StreamOutcome::Completed);
                    }
                }
            }
        }

        self.state = WriterState::Completing;
        let mut line = E::NDJSON_TERMINAL.to_string();
        line.push('\n');
        Ok(if self.write_flushed(&line, cancel).await? {
            StreamOutcome::Completed
        } else {
            StreamOutcome::Cancelled
        })
    }

    /// Returns `false` when cancelled before the line was fully written.
    async fn emit<E: WireFrame>(
        &mut self,
        event: &E,
        finished: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        let line = self.encode(event, finished)?;
        let written = self.write_flushed(&line, cancel).await?;
        if written {
            self.lines += 1;
        }
        Ok(written)
    }

    fn encode<E: WireFrame>(&self, event: &E, finished: bool) -> Result<String, StreamError> {
        let mut value = serde_json::to_value(event)?;
        if let Value::Object(fields) = &mut value {
            if !self.config.include_timestamps {
                fields.shift_remove("ts");
            }
            if finished {
                fields.insert("finished".to_string(), Value::Bool(true));
            }
        }
        let mut line = if self.config.pretty {
            serde_json::to_string_pretty(&value)?
        } else {
            serde_json::to_string(&value)?
        };
        line.push('\n');
        Ok(line)
    }

    async fn write_flushed(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamError> {
        let out = &mut self.out;
        let write = async {
            out.write_all(line.as_bytes()).await?;
            out.flush().await
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(false),
            written = write => {
                written?;
                Ok(true)
            }
        }
    }
}
