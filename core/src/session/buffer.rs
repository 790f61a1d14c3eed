use std::time::Duration;

use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::source::StreamMessage;

/// Messages fetched since the last hand-off to the segment builder.
pub(crate) struct SegmentBuffer<O> {
    messages: Vec<StreamMessage<O>>,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl<O> SegmentBuffer<O> {
    pub(crate) fn new() -> Self {
        Self {
            messages: Vec::new(),
            bytes: 0,
            opened_at: None,
        }
    }

    pub(crate) fn extend(&mut self, messages: Vec<StreamMessage<O>>, now: Instant) {
        if messages.is_empty() {
            return;
        }
        self.opened_at.get_or_insert(now);
        self.bytes += messages.iter().map(StreamMessage::size_bytes).sum::<usize>();
        self.messages.extend(messages);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or_default()
    }

    /// Whether any configured threshold is crossed. The millis threshold is
    /// skipped while catching up.
    pub(crate) fn is_full(&self, config: &SessionConfig, now: Instant, catching_up: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        let bytes = config
            .checkpoint_threshold_bytes
            .is_some_and(|limit| self.bytes >= limit);
        let rows = config
            .checkpoint_threshold_rows
            .is_some_and(|limit| self.len() >= limit);
        let age = !catching_up
            && config
                .checkpoint_threshold_millis
                .is_some_and(|limit| self.age(now) >= Duration::from_millis(limit));
        bytes || rows || age
    }

    /// Puts messages taken earlier back in front of anything buffered since.
    pub(crate) fn restore(&mut self, messages: Vec<StreamMessage<O>>, now: Instant) {
        if messages.is_empty() {
            return;
        }
        let newer = self.take();
        self.extend(messages, now);
        self.extend(newer, now);
    }

    /// Moves the buffered messages out, leaving the buffer empty.
    pub(crate) fn take(&mut self) -> Vec<StreamMessage<O>> {
        self.bytes = 0;
        self.opened_at = None;
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::LongOffset;

    fn messages(range: std::ops::Range<i64>) -> Vec<StreamMessage<LongOffset>> {
        range.map(|o| StreamMessage::new(vec![0u8; 10], LongOffset(o))).collect()
    }

    fn config() -> SessionConfig {
        SessionConfig {
            checkpoint_threshold_bytes: Some(100),
            checkpoint_threshold_rows: None,
            checkpoint_threshold_millis: Some(1000),
            ..SessionConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_threshold() {
        let mut buffer = SegmentBuffer::new();
        let now = Instant::now();

        buffer.extend(messages(0..9), now);
        assert_eq!(buffer.bytes(), 90);
        assert!(!buffer.is_full(&config(), now, false));

        buffer.extend(messages(9..10), now);
        assert!(buffer.is_full(&config(), now, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_threshold_ignored_while_catching_up() {
        let mut buffer = SegmentBuffer::new();
        buffer.extend(messages(0..1), Instant::now());

        tokio::time::advance(Duration::from_millis(1500)).await;
        let now = Instant::now();
        assert!(buffer.is_full(&config(), now, false));
        assert!(!buffer.is_full(&config(), now, true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_resets() {
        let mut buffer = SegmentBuffer::new();
        buffer.extend(messages(0..3), Instant::now());

        let taken = buffer.take();
        assert_eq!(taken.len(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
        assert_eq!(buffer.age(Instant::now()), Duration::ZERO);
        assert!(!buffer.is_full(&config(), Instant::now(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_puts_messages_back_in_order() {
        let mut buffer = SegmentBuffer::new();
        buffer.extend(messages(0..3), Instant::now());
        let taken = buffer.take();
        buffer.extend(messages(3..4), Instant::now());

        buffer.restore(taken, Instant::now());
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.bytes(), 40);
        let offsets: Vec<_> = buffer.take().into_iter().map(|m| m.offset).collect();
        assert_eq!(offsets, (0..4).map(LongOffset).collect::<Vec<_>>());
    }
}
