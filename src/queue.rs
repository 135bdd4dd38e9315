//! Bounded FIFO with blocking push/pop and an explicit close signal.
//!
//! Dropping every [`QueueSender`] ends the queue gracefully: the receiver
//! drains what is buffered and then yields `None`. Calling `close()` on either
//! side aborts it: blocked pushes fail, blocked pops return `None`, and the
//! buffered items are discarded.

use futures::StreamExt as _;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Creates a queue holding at most `capacity` items (minimum one).
pub fn bounded<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    bounded_with_signal(capacity, CancellationToken::new())
}

/// Same as [`bounded`], closing when `signal` is cancelled.
pub fn bounded_with_signal<T>(
    capacity: usize,
    signal: CancellationToken,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender {
            tx,
            closed: signal.clone(),
        },
        QueueReceiver { rx, closed: signal },
    )
}

pub struct QueueSender<T> {
    tx: mpsc::Sender<T>,
    closed: CancellationToken,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Waits for a free slot. Fails once the queue is closed, including while
    /// blocked on a full queue.
    pub async fn push(&self, item: T) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueClosed),
            sent = self.tx.send(item) => sent.map_err(|_| QueueClosed),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the queue is closed or the receiver is gone.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    closed: CancellationToken,
}

impl<T: Send + 'static> QueueReceiver<T> {
    /// Waits for the next item in FIFO order.
    pub async fn pop(&mut self) -> Option<T> {
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Items in arrival order; ends on close or once every sender is gone.
    pub fn into_stream(self) -> BoxStream<'static, T> {
        let closed = self.closed;
        ReceiverStream::new(self.rx)
            .take_until(closed.cancelled_owned())
            .boxed()
    }
}
