pub mod delta;
pub mod memory;

use std::future::Future;

use crate::config::SinkConfig;
use crate::errors::SegmentError;
use crate::offset::{LongOffset, StreamOffset};
use crate::sink::delta::DeltaSegmentBuilder;
use crate::sink::memory::MemorySegmentBuilder;
use crate::source::StreamMessage;

/// A completed buffer: the ordered raw messages of one partition group and
/// the checkpoint offset marking their (exclusive) upper bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment<O> {
    pub partition_group: String,
    pub messages: Vec<StreamMessage<O>>,
    pub end_offset: O,
}

impl<O: StreamOffset> Segment<O> {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.messages.iter().map(StreamMessage::size_bytes).sum()
    }

    pub fn start_offset(&self) -> Option<&O> {
        self.messages.first().map(|m| &m.offset)
    }
}

/// A segment the builder could not persist, handed back so the caller can
/// retry the same buffer.
#[derive(Debug)]
pub struct SegmentRejected<O> {
    pub segment: Segment<O>,
    pub error: SegmentError,
}

/// The `SegmentBuilder` trait defines the contract for any destination that
/// turns buffered messages into durable segments.
///
/// Segments are staged by `build` and stay invisible to readers until
/// `publish`. The session publishes only after the checkpoint covering the
/// staged segments is accepted, and discards them when another replica's
/// checkpoint already covers them.
pub trait SegmentBuilder<O: StreamOffset>: Send {
    /// Stages a segment. Takes ownership and gives it back only on failure.
    fn build(
        &mut self,
        segment: Segment<O>,
    ) -> impl Future<Output = Result<(), SegmentRejected<O>>> + Send;

    /// Makes every staged segment visible and returns how many there were.
    /// On failure the segments stay staged and a later call publishes them.
    fn publish(&mut self) -> impl Future<Output = Result<usize, SegmentError>> + Send;

    /// Drops every staged segment and returns how many there were.
    fn discard(&mut self) -> usize;
}

/// Segment destinations selectable from configuration.
pub enum SegmentSink {
    Delta(DeltaSegmentBuilder),
    Memory(MemorySegmentBuilder<LongOffset>),
}

impl SegmentSink {
    pub fn from_config(config: &SinkConfig) -> Self {
        match config {
            SinkConfig::Delta(options) => SegmentSink::Delta(DeltaSegmentBuilder::new(options.clone())),
            SinkConfig::Memory => SegmentSink::Memory(MemorySegmentBuilder::new()),
        }
    }
}

impl SegmentBuilder<LongOffset> for SegmentSink {
    async fn build(&mut self, segment: Segment<LongOffset>) -> Result<(), SegmentRejected<LongOffset>> {
        match self {
            SegmentSink::Delta(builder) => builder.build(segment).await,
            SegmentSink::Memory(builder) => builder.build(segment).await,
        }
    }

    async fn publish(&mut self) -> Result<usize, SegmentError> {
        match self {
            SegmentSink::Delta(builder) => builder.publish().await,
            SegmentSink::Memory(builder) => builder.publish().await,
        }
    }

    fn discard(&mut self) -> usize {
        match self {
            SegmentSink::Delta(builder) => builder.discard(),
            SegmentSink::Memory(builder) => builder.discard(),
        }
    }
}
