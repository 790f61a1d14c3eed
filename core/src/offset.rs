use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::CorruptOffset;

/// A position within one partition's message sequence.
///
/// Offsets are opaque to the session: it only compares them, clones them and
/// persists them through their textual form. `parse(o.to_string())` must yield
/// a value comparing equal to `o`.
pub trait StreamOffset: Clone + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn parse(text: &str) -> Result<Self, CorruptOffset>;
}

/// Offset for sources that address messages by a signed 64-bit position
/// (Kafka offsets, the in-memory log).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LongOffset(pub i64);

impl LongOffset {
    pub fn value(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        LongOffset(self.0 + 1)
    }
}

impl From<i64> for LongOffset {
    fn from(value: i64) -> Self {
        LongOffset(value)
    }
}

impl fmt::Display for LongOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamOffset for LongOffset {
    fn parse(text: &str) -> Result<Self, CorruptOffset> {
        text.trim()
            .parse::<i64>()
            .map(LongOffset)
            .map_err(|e| CorruptOffset {
                raw: text.to_string(),
                reason: e.to_string(),
            })
    }
}
