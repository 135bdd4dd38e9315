//! The provider-facing side of a stream session.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::queue::{self, QueueClosed, QueueReceiver, QueueSender};

/// Ordered, closable sequence of generation events.
///
/// `close` must be idempotent, must unblock a pending `next_event`, and must
/// tell the producer to stop.
#[async_trait]
pub trait SourceStream: Send + Sync {
    /// Next event in provider order; `None` once the stream is exhausted or
    /// closed.
    async fn next_event(&self) -> Option<Event>;

    fn close(&self);
}

/// Producer handle paired with a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceSender {
    queue: QueueSender<Event>,
}

impl SourceSender {
    /// Blocks while the source buffer is full; fails once the consumer
    /// closed the source.
    pub async fn send(&self, event: Event) -> Result<(), QueueClosed> {
        self.queue.push(event).await
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Resolves when the consumer closes the source.
    pub async fn closed(&self) {
        self.queue.closed().await
    }
}

/// Reference [`SourceStream`] backed by a bounded queue.
pub struct ChannelSource {
    rx: Mutex<QueueReceiver<Event>>,
    closed: CancellationToken,
    close_calls: AtomicUsize,
}

pub fn channel(capacity: usize) -> (SourceSender, ChannelSource) {
    let closed = CancellationToken::new();
    let (tx, rx) = queue::bounded_with_signal(capacity, closed.clone());
    let source = ChannelSource {
        rx: Mutex::new(rx),
        closed,
        close_calls: AtomicUsize::new(0),
    };
    (SourceSender { queue: tx }, source)
}

impl ChannelSource {
    pub fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::Acquire) > 0
    }

    /// How many times `close` was invoked.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SourceStream for ChannelSource {
    async fn next_event(&self) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        rx.pop().await
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        self.closed.cancel();
    }
}
