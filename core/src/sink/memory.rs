use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::errors::SegmentError;
use crate::offset::StreamOffset;
use crate::sink::{Segment, SegmentBuilder, SegmentRejected};

#[derive(Debug)]
struct State<O> {
    staged: Vec<Segment<O>>,
    segments: Vec<Segment<O>>,
    discarded: usize,
    failures_left: u32,
    publish_failures_left: u32,
}

/// Keeps segments in memory. Clones share the same lists, so a test can keep
/// a handle while the session owns the builder.
#[derive(Debug, Clone)]
pub struct MemorySegmentBuilder<O> {
    state: Arc<Mutex<State<O>>>,
}

impl<O> Default for MemorySegmentBuilder<O> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                staged: Vec::new(),
                segments: Vec::new(),
                discarded: 0,
                failures_left: 0,
                publish_failures_left: 0,
            })),
        }
    }
}

impl<O: StreamOffset> MemorySegmentBuilder<O> {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State<O>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Published segments, in publish order.
    pub fn segments(&self) -> Vec<Segment<O>> {
        self.state().segments.clone()
    }

    pub fn segment_count(&self) -> usize {
        self.state().segments.len()
    }

    pub fn message_count(&self) -> usize {
        self.state().segments.iter().map(Segment::len).sum()
    }

    pub fn staged_count(&self) -> usize {
        self.state().staged.len()
    }

    pub fn discarded_count(&self) -> usize {
        self.state().discarded
    }

    /// Rejects the next `count` segments with a write error.
    pub fn fail_next(&self, count: u32) {
        self.state().failures_left = count;
    }

    /// Fails the next `count` publish calls.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state().publish_failures_left = count;
    }
}

impl<O: StreamOffset> SegmentBuilder<O> for MemorySegmentBuilder<O> {
    async fn build(&mut self, segment: Segment<O>) -> Result<(), SegmentRejected<O>> {
        let mut state = self.state();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(SegmentRejected {
                segment,
                error: SegmentError::Write {
                    reason: "injected failure".to_string(),
                },
            });
        }
        debug!(
            partition_group = %segment.partition_group,
            messages = segment.len(),
            end_offset = %segment.end_offset,
            "Staged segment in memory"
        );
        state.staged.push(segment);
        Ok(())
    }

    async fn publish(&mut self) -> Result<usize, SegmentError> {
        let mut state = self.state();
        if state.publish_failures_left > 0 {
            state.publish_failures_left -= 1;
            return Err(SegmentError::Write {
                reason: "injected publish failure".to_string(),
            });
        }
        let staged = std::mem::take(&mut state.staged);
        let published = staged.len();
        state.segments.extend(staged);
        Ok(published)
    }

    fn discard(&mut self) -> usize {
        let mut state = self.state();
        let discarded = std::mem::take(&mut state.staged).len();
        state.discarded += discarded;
        discarded
    }
}
