//! Background forwarding from a [`SourceStream`] through the [`Normalizer`]
//! onto a bounded queue consumed by a protocol writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::normalizer::Normalizer;
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::schema::NormalizedEvent;
use crate::source::SourceStream;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub struct NormalizedPipeline {
    cancel: CancellationToken,
    source: Arc<dyn SourceStream>,
    source_closed: AtomicBool,
    task: Option<JoinHandle<u64>>,
}

impl NormalizedPipeline {
    /// Spawns the forwarding task.
    ///
    /// The task stops when `parent` is cancelled, when [`close`](Self::close)
    /// is called, or when the source is exhausted. The returned receiver ends
    /// after the last forwarded event.
    pub fn start(
        source: Arc<dyn SourceStream>,
        normalizer: Normalizer,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, QueueReceiver<NormalizedEvent>) {
        let cancel = parent.child_token();
        let (tx, rx) = queue::bounded_with_signal(capacity, cancel.clone());
        let task = tokio::spawn(forward(source.clone(), normalizer, tx, cancel.clone()));
        let pipeline = Self {
            cancel,
            source,
            source_closed: AtomicBool::new(false),
            task: Some(task),
        };
        (pipeline, rx)
    }

    /// Stops forwarding and closes the source. Safe to call repeatedly.
    pub fn close(&self) {
        self.cancel.cancel();
        if !self.source_closed.swap(true, Ordering::AcqRel) {
            self.source.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.source_closed.load(Ordering::Acquire)
    }

    /// Waits for the forwarding task and returns how many events it forwarded.
    pub async fn join(&mut self) -> u64 {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|err| {
                log::warn!("pipeline forwarding task failed: {}", err);
                0
            }),
            None => 0,
        }
    }
}

impl Drop for NormalizedPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward(
    source: Arc<dyn SourceStream>,
    normalizer: Normalizer,
    tx: QueueSender<NormalizedEvent>,
    cancel: CancellationToken,
) -> u64 {
    let mut forwarded = 0_u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = source.next_event() => next,
        };
        let Some(event) = next else {
            break;
        };
        let normalized = normalizer.normalize(event);
        // push also watches the cancel signal, so a full queue cannot wedge us
        if tx.push(normalized).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    log::debug!(
        "pipeline forwarding stopped after {} events (request_id={:?})",
        forwarded,
        normalizer.metadata().request_id
    );
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, Usage};
    use crate::normalizer::StreamMetadata;
    use crate::schema::EventType;
    use crate::source::{ChannelSource, channel};
    use std::time::Duration;
    use tokio::time::timeout;

    fn normalizer() -> Normalizer {
        Normalizer::new(StreamMetadata::new("test", "model-a").with_request_id("req"))
    }

    fn start(
        source: Arc<ChannelSource>,
        capacity: usize,
    ) -> (NormalizedPipeline, QueueReceiver<NormalizedEvent>, CancellationToken) {
        let parent = CancellationToken::new();
        let (pipeline, rx) = NormalizedPipeline::start(source, normalizer(), capacity, &parent);
        (pipeline, rx, parent)
    }

    #[tokio::test]
    async fn forwards_in_order_with_sequence_numbers() {
        let (tx, source) = channel(8);
        let source = Arc::new(source);
        let (mut pipeline, mut rx, _parent) = start(source.clone(), 4);

        tokio::spawn(async move {
            tx.send(Event::Start).await.expect("send");
            for word in ["The ", "quick ", "fox"] {
                tx.send(Event::text(word)).await.expect("send");
            }
            tx.send(Event::finish(Some(Usage::new(4, 8)), Some("stop")))
                .await
                .expect("send");
        });

        let mut events = Vec::new();
        while let Some(event) = rx.pop().await {
            events.push(event);
        }
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(events[0].event_type, EventType::Start);
        assert_eq!(events[2].text.as_deref(), Some("quick "));
        assert_eq!(events[4].event_type, EventType::Finish);
        assert_eq!(pipeline.join().await, 5);
    }

    #[tokio::test]
    async fn concurrent_producers_get_gap_free_sequence() {
        let (tx, source) = channel(16);
        let source = Arc::new(source);
        let (mut pipeline, mut rx, _parent) = start(source, 8);

        for producer in 0..4 {
            let tx = tx.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    tx.send(Event::text(format!("{producer}:{i}"))).await.expect("send");
                }
            });
        }
        drop(tx);

        let mut seqs = Vec::new();
        let mut per_producer: Vec<Vec<u32>> = vec![Vec::new(); 4];
        while let Some(event) = rx.pop().await {
            seqs.push(event.seq);
            let text = event.text.expect("text");
            let (producer, i) = text.split_once(':').expect("tagged");
            per_producer[producer.parse::<usize>().expect("producer")]
                .push(i.parse().expect("index"));
        }
        assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
        for order in per_producer {
            assert_eq!(order, (0..50).collect::<Vec<_>>());
        }
        assert_eq!(pipeline.join().await, 200);
    }

    #[tokio::test]
    async fn close_aborts_blocked_forward_and_closes_source() {
        let (tx, source) = channel(64);
        let source = Arc::new(source);
        let (mut pipeline, _rx, _parent) = start(source.clone(), 1);

        for i in 0..10 {
            tx.send(Event::text(i.to_string())).await.expect("send");
        }
        // nobody pops: the task is parked on a full queue
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.close();
        pipeline.close();

        let forwarded = timeout(Duration::from_millis(500), pipeline.join())
            .await
            .expect("task stops");
        assert!(forwarded <= 2);
        assert_eq!(source.close_calls(), 1);
        assert!(tx.send(Event::text("late")).await.is_err());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_task() {
        let (_tx, source) = channel(4);
        let source = Arc::new(source);
        let (mut pipeline, mut rx, parent) = start(source.clone(), 4);

        parent.cancel();
        timeout(Duration::from_millis(500), pipeline.join())
            .await
            .expect("task stops");
        assert!(rx.pop().await.is_none());
        assert!(!source.is_closed());
        drop(pipeline);
        assert!(source.is_closed());
    }
}
