pub mod kafka;
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::config::SourceConfig;
use crate::errors::{ConsumptionError, SourceError};
use crate::offset::{LongOffset, StreamOffset};
use crate::source::kafka::KafkaPartitionConsumer;
use crate::source::memory::{MemoryPartitionConsumer, MemoryStream};

/// A message received from source regardless of whether it's Kafka, an
/// in-memory log, etc.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage<O> {
    /// raw payload of message e.g. kafka message body
    pub payload: Vec<u8>,
    /// position of this message within its partition
    pub offset: O,
    /// Optional key/value headers for metadata.
    pub headers: HashMap<String, Vec<u8>>,
}

impl<O> StreamMessage<O> {
    pub fn new(payload: impl Into<Vec<u8>>, offset: O) -> Self {
        Self {
            payload: payload.into(),
            offset,
            headers: HashMap::new(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// The result of one `fetch` call. An empty batch means the source had no data
/// within the timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBatch<O> {
    messages: Vec<StreamMessage<O>>,
    offset_of_next_batch: O,
    end_of_partition_group: bool,
}

impl<O: StreamOffset> MessageBatch<O> {
    pub fn new(messages: Vec<StreamMessage<O>>, offset_of_next_batch: O) -> Self {
        Self {
            messages,
            offset_of_next_batch,
            end_of_partition_group: false,
        }
    }

    pub fn empty(offset_of_next_batch: O) -> Self {
        Self::new(Vec::new(), offset_of_next_batch)
    }

    /// Marks the batch as the last one the partition group will ever produce.
    pub fn end_of_partition_group(mut self) -> Self {
        self.end_of_partition_group = true;
        self
    }

    pub fn messages(&self) -> &[StreamMessage<O>] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<StreamMessage<O>> {
        self.messages
    }

    pub fn offset_of_next_batch(&self) -> &O {
        &self.offset_of_next_batch
    }

    pub fn is_end_of_partition_group(&self) -> bool {
        self.end_of_partition_group
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.messages.iter().map(StreamMessage::size_bytes).sum()
    }

    /// Checks the batch against the offset it was fetched from: every message
    /// at or after `start`, offsets non-decreasing, and the resume offset
    /// strictly past the last message.
    pub fn validate(&self, start: &O) -> Result<(), ConsumptionError> {
        let mut floor = start;
        for message in &self.messages {
            if message.offset < *floor {
                return Err(ConsumptionError::OffsetRegression {
                    context: "fetch",
                    expected: floor.to_string(),
                    found: message.offset.to_string(),
                });
            }
            floor = &message.offset;
        }

        let next_ok = match self.messages.last() {
            Some(last) => self.offset_of_next_batch > last.offset,
            None => self.offset_of_next_batch >= *start,
        };
        if !next_ok {
            return Err(ConsumptionError::OffsetRegression {
                context: "offset_of_next_batch",
                expected: floor.to_string(),
                found: self.offset_of_next_batch.to_string(),
            });
        }
        Ok(())
    }
}

/// What an adapter actually does for the two operations that may be no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// `start` performs real preparation (connection, assignment, prefetch).
    pub prepares_on_start: bool,
    /// `checkpoint` records progress on the source side.
    pub checkpoints_on_source: bool,
}

/// A consumer bound to exactly one partition group for its whole lifetime.
///
/// Lifecycle: `start` → any number of `fetch`/`checkpoint` → `close`. Every
/// adapter implements all four operations and reports through `capabilities`
/// which of `start` and `checkpoint` are no-ops.
pub trait PartitionConsumer: Send {
    type Offset: StreamOffset;

    fn capabilities(&self) -> SourceCapabilities;

    /// Prepares consumption from `offset` (inclusive). Calling it more than
    /// once must not corrupt state.
    fn start(
        &mut self,
        offset: &Self::Offset,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Fetches messages starting at `start` (inclusive), returning within
    /// `timeout`. No data within the timeout yields an empty batch, never an
    /// error.
    fn fetch(
        &mut self,
        start: &Self::Offset,
        timeout: Duration,
    ) -> impl Future<Output = Result<MessageBatch<Self::Offset>, SourceError>> + Send;

    /// Records on the source that everything before `last` (exclusive) is
    /// captured. Returns the resume offset, which must compare equal to `last`.
    fn checkpoint(
        &mut self,
        last: &Self::Offset,
    ) -> impl Future<Output = Result<Self::Offset, SourceError>> + Send;

    /// Releases resources. Safe to call more than once.
    fn close(&mut self);
}

/// Owns a consumer and closes it when dropped, so a cancelled session still
/// releases the source.
pub(crate) struct ConsumerGuard<C: PartitionConsumer> {
    consumer: C,
    closed: bool,
}

impl<C: PartitionConsumer> ConsumerGuard<C> {
    pub(crate) fn new(consumer: C) -> Self {
        Self {
            consumer,
            closed: false,
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.closed {
            self.consumer.close();
            self.closed = true;
        }
    }
}

impl<C: PartitionConsumer> Deref for ConsumerGuard<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.consumer
    }
}

impl<C: PartitionConsumer> DerefMut for ConsumerGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.consumer
    }
}

impl<C: PartitionConsumer> Drop for ConsumerGuard<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// The stream technologies this crate can consume, selected from configuration.
pub enum StreamSource {
    Kafka(KafkaPartitionConsumer),
    Memory(MemoryPartitionConsumer),
}

impl StreamSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        match config {
            SourceConfig::Kafka(options) => {
                Ok(StreamSource::Kafka(KafkaPartitionConsumer::new(options.clone())))
            }
            SourceConfig::Memory(options) => {
                let stream = MemoryStream::new();
                stream.append_all(options.messages.iter().map(|m| m.as_bytes().to_vec()));
                if options.sealed {
                    stream.seal();
                }
                Ok(StreamSource::Memory(MemoryPartitionConsumer::new(
                    stream,
                    options.max_batch_size,
                )))
            }
        }
    }
}

impl PartitionConsumer for StreamSource {
    type Offset = LongOffset;

    fn capabilities(&self) -> SourceCapabilities {
        match self {
            StreamSource::Kafka(c) => c.capabilities(),
            StreamSource::Memory(c) => c.capabilities(),
        }
    }

    async fn start(&mut self, offset: &LongOffset) -> Result<(), SourceError> {
        match self {
            StreamSource::Kafka(c) => c.start(offset).await,
            StreamSource::Memory(c) => c.start(offset).await,
        }
    }

    async fn fetch(
        &mut self,
        start: &LongOffset,
        timeout: Duration,
    ) -> Result<MessageBatch<LongOffset>, SourceError> {
        match self {
            StreamSource::Kafka(c) => c.fetch(start, timeout).await,
            StreamSource::Memory(c) => c.fetch(start, timeout).await,
        }
    }

    async fn checkpoint(&mut self, last: &LongOffset) -> Result<LongOffset, SourceError> {
        match self {
            StreamSource::Kafka(c) => c.checkpoint(last).await,
            StreamSource::Memory(c) => c.checkpoint(last).await,
        }
    }

    fn close(&mut self) {
        match self {
            StreamSource::Kafka(c) => c.close(),
            StreamSource::Memory(c) => c.close(),
        }
    }
}
