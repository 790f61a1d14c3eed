#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use consume_core::checkpoint::CheckpointCoordinator;
use consume_core::checkpoint::store::{InMemoryMetadataStore, MetadataStore};
use consume_core::config::SessionConfig;
use consume_core::errors::{SourceError, StoreError};
use consume_core::offset::LongOffset;
use consume_core::retry::RetryPolicy;
use consume_core::session::ConsumptionSession;
use consume_core::sink::memory::MemorySegmentBuilder;
use consume_core::source::memory::{MemoryPartitionConsumer, MemoryStream};
use consume_core::source::{MessageBatch, PartitionConsumer, SourceCapabilities, StreamMessage};

pub type MemorySession<S> =
    ConsumptionSession<MemoryPartitionConsumer, MemorySegmentBuilder<LongOffset>, S>;

/// Short timeouts and no size thresholds apart from a large row count.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        fetch_timeout_ms: 100,
        idle_fetch_timeout_ms: 1000,
        fetch_grace_ms: 50,
        max_consecutive_empty_fetches: 3,
        idle_after_ms: None,
        checkpoint_threshold_bytes: None,
        checkpoint_threshold_rows: Some(1000),
        checkpoint_threshold_millis: None,
        catch_up_deadline_ms: None,
        max_transient_retries: 3,
        retry_backoff_base_ms: 10,
        retry_backoff_max_ms: 40,
        checkpoint_timeout_ms: 1000,
        checkpoint_max_retries: 1,
    }
}

pub fn coordinator<S: MetadataStore>(store: &Arc<S>, replica: &str) -> CheckpointCoordinator<S> {
    CheckpointCoordinator::new(store.clone(), replica).with_retry(
        RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(40)),
        1,
    )
}

/// A stream holding `count` ten-byte payloads.
pub fn stream_with(count: usize) -> MemoryStream {
    let stream = MemoryStream::new();
    stream.append_all((0..count).map(|i| format!("message-{:02}", i % 100).into_bytes()));
    stream
}

pub fn memory_session<S: MetadataStore>(
    stream: &MemoryStream,
    builder: &MemorySegmentBuilder<LongOffset>,
    store: &Arc<S>,
    config: SessionConfig,
    max_batch_size: usize,
) -> MemorySession<S> {
    ConsumptionSession::new(
        "orders-0",
        MemoryPartitionConsumer::new(stream.clone(), max_batch_size),
        builder.clone(),
        coordinator(store, "replica-a"),
        config,
        LongOffset(0),
    )
}

/// Reads work; the next `n` compare-and-swap calls fail as if the store were
/// unreachable.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryMetadataStore,
    failing_writes: AtomicU32,
}

impl FlakyStore {
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }
}

impl MetadataStore for FlakyStore {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.read(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, StoreError> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable {
                reason: "injected write failure".to_string(),
            });
        }
        self.inner.compare_and_swap(key, expected, new_value).await
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Misbehavior {
    /// Returns a message one offset before the requested start.
    RegressingFetch,
    /// Confirms a checkpoint one offset before the one it was asked for.
    RegressingCheckpoint,
    /// Never returns from `fetch`.
    Hang,
    /// `start` always fails with a transient error.
    FailingStart,
}

/// An adapter that breaks its contract in one specific way.
pub struct MisbehavingConsumer {
    pub mode: Misbehavior,
}

impl PartitionConsumer for MisbehavingConsumer {
    type Offset = LongOffset;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            prepares_on_start: false,
            checkpoints_on_source: true,
        }
    }

    async fn start(&mut self, _offset: &LongOffset) -> Result<(), SourceError> {
        match self.mode {
            Misbehavior::FailingStart => Err(SourceError::transient("broker not reachable")),
            _ => Ok(()),
        }
    }

    async fn fetch(
        &mut self,
        start: &LongOffset,
        _timeout: Duration,
    ) -> Result<MessageBatch<LongOffset>, SourceError> {
        match self.mode {
            Misbehavior::FailingStart => Err(SourceError::fatal("fetch before start")),
            Misbehavior::RegressingFetch => Ok(MessageBatch::new(
                vec![StreamMessage::new("late", LongOffset(start.value() - 1))],
                start.next(),
            )),
            Misbehavior::RegressingCheckpoint => Ok(MessageBatch::new(
                vec![StreamMessage::new("m", *start)],
                start.next(),
            )),
            Misbehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(MessageBatch::empty(*start))
            }
        }
    }

    async fn checkpoint(&mut self, last: &LongOffset) -> Result<LongOffset, SourceError> {
        match self.mode {
            Misbehavior::RegressingCheckpoint => Ok(LongOffset(last.value() - 1)),
            _ => Ok(*last),
        }
    }

    fn close(&mut self) {}
}

/// Wraps a consumer and counts how often it is closed.
pub struct CountingConsumer<C> {
    inner: C,
    closes: Arc<AtomicUsize>,
}

impl<C> CountingConsumer<C> {
    pub fn new(inner: C) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                closes: closes.clone(),
            },
            closes,
        )
    }
}

impl<C: PartitionConsumer> PartitionConsumer for CountingConsumer<C> {
    type Offset = C::Offset;

    fn capabilities(&self) -> SourceCapabilities {
        self.inner.capabilities()
    }

    async fn start(&mut self, offset: &C::Offset) -> Result<(), SourceError> {
        self.inner.start(offset).await
    }

    async fn fetch(
        &mut self,
        start: &C::Offset,
        timeout: Duration,
    ) -> Result<MessageBatch<C::Offset>, SourceError> {
        self.inner.fetch(start, timeout).await
    }

    async fn checkpoint(&mut self, last: &C::Offset) -> Result<C::Offset, SourceError> {
        self.inner.checkpoint(last).await
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }
}
