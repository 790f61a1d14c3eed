use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::SourceError;
use crate::offset::LongOffset;
use crate::source::{MessageBatch, PartitionConsumer, SourceCapabilities, StreamMessage};

#[derive(Default)]
struct Inner {
    log: Mutex<Vec<Vec<u8>>>,
    committed: Mutex<Option<LongOffset>>,
    pending_errors: Mutex<VecDeque<SourceError>>,
    sealed: AtomicBool,
    appended: Notify,
}

/// An append-only, in-process partition. Offsets are positions in the log,
/// starting at zero. Cloning shares the same log.
#[derive(Clone, Default)]
pub struct MemoryStream {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, payload: impl Into<Vec<u8>>) -> LongOffset {
        let offset = {
            let mut log = lock(&self.inner.log);
            log.push(payload.into());
            LongOffset(log.len() as i64 - 1)
        };
        self.inner.appended.notify_waiters();
        offset
    }

    pub fn append_all<I>(&self, payloads: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        lock(&self.inner.log).extend(payloads);
        self.inner.appended.notify_waiters();
    }

    /// Retires the partition: once a reader reaches the end it gets a batch
    /// flagged as end of partition group.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::SeqCst);
        self.inner.appended.notify_waiters();
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.log).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last offset recorded through `checkpoint`.
    pub fn committed(&self) -> Option<LongOffset> {
        *lock(&self.inner.committed)
    }

    /// Makes the next fetches fail with the given errors, in order.
    pub fn fail_next_fetches(&self, errors: impl IntoIterator<Item = SourceError>) {
        lock(&self.inner.pending_errors).extend(errors);
    }

    fn take_pending_error(&self) -> Option<SourceError> {
        lock(&self.inner.pending_errors).pop_front()
    }

    fn read_from(&self, start: LongOffset, max: usize) -> Option<MessageBatch<LongOffset>> {
        let log = lock(&self.inner.log);
        let from = start.value().max(0) as usize;
        if from < log.len() {
            let to = (from + max).min(log.len());
            let messages = log[from..to]
                .iter()
                .enumerate()
                .map(|(i, payload)| StreamMessage::new(payload.clone(), LongOffset((from + i) as i64)))
                .collect();
            return Some(MessageBatch::new(messages, LongOffset(to as i64)));
        }
        if self.inner.sealed.load(Ordering::SeqCst) {
            return Some(MessageBatch::empty(start).end_of_partition_group());
        }
        None
    }
}

/// Reads a [`MemoryStream`].
///
/// `start` is a no-op. `checkpoint` records the offset on the stream so it can
/// be inspected through [`MemoryStream::committed`].
pub struct MemoryPartitionConsumer {
    stream: MemoryStream,
    max_batch_size: usize,
    closed: bool,
}

impl MemoryPartitionConsumer {
    pub fn new(stream: MemoryStream, max_batch_size: usize) -> Self {
        Self {
            stream,
            max_batch_size: max_batch_size.max(1),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl PartitionConsumer for MemoryPartitionConsumer {
    type Offset = LongOffset;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            prepares_on_start: false,
            checkpoints_on_source: true,
        }
    }

    async fn start(&mut self, _offset: &LongOffset) -> Result<(), SourceError> {
        Ok(())
    }

    async fn fetch(
        &mut self,
        start: &LongOffset,
        timeout: Duration,
    ) -> Result<MessageBatch<LongOffset>, SourceError> {
        if self.closed {
            return Err(SourceError::fatal("fetch on a closed consumer"));
        }
        if let Some(err) = self.stream.take_pending_error() {
            return Err(err);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.stream.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(batch) = self.stream.read_from(*start, self.max_batch_size) {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                debug!(offset = %start, "memory fetch timed out");
                return Ok(self
                    .stream
                    .read_from(*start, self.max_batch_size)
                    .unwrap_or_else(|| MessageBatch::empty(*start)));
            }
        }
    }

    async fn checkpoint(&mut self, last: &LongOffset) -> Result<LongOffset, SourceError> {
        *lock(&self.stream.inner.committed) = Some(*last);
        Ok(*last)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fetch_returns_available_messages() {
        let stream = MemoryStream::new();
        for i in 0..5 {
            stream.append(format!("message-{}", i));
        }
        let mut consumer = MemoryPartitionConsumer::new(stream, 3);

        let batch = consumer
            .fetch(&LongOffset(1), Duration::from_secs(1))
            .await
            .expect("fetch failed");
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.messages()[0].offset, LongOffset(1));
        assert_eq!(batch.messages()[0].payload, b"message-1".to_vec());
        assert_eq!(*batch.offset_of_next_batch(), LongOffset(4));
        assert!(!batch.is_end_of_partition_group());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out_with_empty_batch() {
        let mut consumer = MemoryPartitionConsumer::new(MemoryStream::new(), 10);

        let started = Instant::now();
        let batch = consumer
            .fetch(&LongOffset(0), Duration::from_millis(250))
            .await
            .expect("timeout must not be an error");
        assert!(batch.is_empty());
        assert_eq!(*batch.offset_of_next_batch(), LongOffset(0));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_wakes_up_on_append() {
        let stream = MemoryStream::new();
        let mut consumer = MemoryPartitionConsumer::new(stream.clone(), 10);

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stream.append("late");
        });

        let started = Instant::now();
        let batch = consumer
            .fetch(&LongOffset(0), Duration::from_secs(10))
            .await
            .expect("fetch failed");
        producer.await.expect("producer panicked");

        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_sealed_stream_signals_end_of_partition_group() {
        let stream = MemoryStream::new();
        stream.append("only");
        stream.seal();
        let mut consumer = MemoryPartitionConsumer::new(stream, 10);

        let first = consumer
            .fetch(&LongOffset(0), Duration::from_millis(10))
            .await
            .expect("fetch failed");
        assert_eq!(first.len(), 1);
        assert!(!first.is_end_of_partition_group());

        let last = consumer
            .fetch(first.offset_of_next_batch(), Duration::from_millis(10))
            .await
            .expect("fetch failed");
        assert!(last.is_empty());
        assert!(last.is_end_of_partition_group());
    }

    #[tokio::test]
    async fn test_injected_errors_then_recovery() {
        let stream = MemoryStream::new();
        stream.append("a");
        stream.fail_next_fetches([SourceError::transient("blip")]);
        let mut consumer = MemoryPartitionConsumer::new(stream, 10);

        let err = consumer
            .fetch(&LongOffset(0), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());

        let batch = consumer
            .fetch(&LongOffset(0), Duration::from_millis(10))
            .await
            .expect("fetch failed");
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_and_close() {
        let stream = MemoryStream::new();
        let mut consumer = MemoryPartitionConsumer::new(stream.clone(), 10);

        assert_eq!(
            consumer.checkpoint(&LongOffset(7)).await.expect("checkpoint"),
            LongOffset(7)
        );
        assert_eq!(stream.committed(), Some(LongOffset(7)));

        consumer.close();
        consumer.close();
        assert!(consumer.is_closed());
        assert!(
            consumer
                .fetch(&LongOffset(0), Duration::from_millis(1))
                .await
                .unwrap_err()
                .is_fatal()
        );
    }
}
