use std::time::Duration;

use thiserror::Error;

/// The terminal error of a consumption session. Only fatal conditions end up
/// here; transient ones are absorbed by the component that detects them.
#[derive(Error, Debug)]
pub enum ConsumptionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unrecoverable source error: {0}")]
    Fatal(#[source] SourceError),

    #[error("Giving up after {attempts} consecutive transient errors")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ConsumptionError>,
    },

    #[error("Transient fetch error: {0}")]
    TransientFetch(#[source] SourceError),

    #[error("Offset regression in {context}: expected at least {expected}, got {found}")]
    OffsetRegression {
        context: &'static str,
        expected: String,
        found: String,
    },

    #[error("Corrupt offset: {0}")]
    CorruptOffset(#[from] CorruptOffset),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Segment builder error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Session task ended abnormally: {reason}")]
    Aborted { reason: String },
}

/// Coarse classification of a [`ConsumptionError`], surfaced alongside a
/// `Failed` session so the assigner can decide between restart and reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    TransientFetch,
    FatalConsumption,
    OffsetRegression,
    CheckpointWriteTransient,
    CorruptOffset,
}

impl ConsumptionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumptionError::TransientFetch(_) | ConsumptionError::Segment(_) => {
                ErrorKind::TransientFetch
            }
            ConsumptionError::OffsetRegression { .. } => ErrorKind::OffsetRegression,
            ConsumptionError::CorruptOffset(_) => ErrorKind::CorruptOffset,
            ConsumptionError::Checkpoint(CheckpointError::CorruptRecord(_)) => {
                ErrorKind::CorruptOffset
            }
            ConsumptionError::Checkpoint(_) => ErrorKind::CheckpointWriteTransient,
            ConsumptionError::Config(_)
            | ConsumptionError::Fatal(_)
            | ConsumptionError::RetriesExhausted { .. }
            | ConsumptionError::Aborted { .. } => ErrorKind::FatalConsumption,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsumptionError::TransientFetch(_) | ConsumptionError::Segment(_)
        )
    }
}

/// Errors raised by a stream source adapter. Adapters must pick the variant:
/// the session retries `Transient` and fails on `Fatal`.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("A transient error occurred, the operation can be retried: {reason}")]
    Transient {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Unrecoverable error from the source: {reason}")]
    Fatal {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SourceError {
    pub fn transient(reason: impl Into<String>) -> Self {
        SourceError::Transient {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        SourceError::Fatal {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot parse offset {raw:?}: {reason}")]
pub struct CorruptOffset {
    pub raw: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Metadata store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Metadata store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Serialization(_))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint write for {partition_group} failed after {attempts} attempts")]
    Exhausted {
        partition_group: String,
        attempts: u32,
        #[source]
        last: StoreError,
    },

    #[error("Stored checkpoint record is corrupt: {0}")]
    CorruptRecord(#[from] CorruptOffset),

    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),
}

impl CheckpointError {
    /// Whether the session may keep consuming and retry at the next threshold.
    pub fn is_transient(&self) -> bool {
        match self {
            CheckpointError::Exhausted { .. } => true,
            CheckpointError::Store(e) => e.is_transient(),
            CheckpointError::CorruptRecord(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Failed to write segment: {reason}")]
    Write { reason: String },

    #[error("Schema conversion failed: {reason}")]
    Schema { reason: String },

    #[error("Failed to load table from {path}: {reason}")]
    TableLoad { path: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, ConsumptionError>;

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let cases = vec![
            (
                ConsumptionError::TransientFetch(SourceError::transient("blip")),
                ErrorKind::TransientFetch,
            ),
            (
                ConsumptionError::Fatal(SourceError::fatal("auth revoked")),
                ErrorKind::FatalConsumption,
            ),
            (
                ConsumptionError::OffsetRegression {
                    context: "fetch",
                    expected: "10".to_string(),
                    found: "9".to_string(),
                },
                ErrorKind::OffsetRegression,
            ),
            (
                ConsumptionError::CorruptOffset(CorruptOffset {
                    raw: "abc".to_string(),
                    reason: "not a number".to_string(),
                }),
                ErrorKind::CorruptOffset,
            ),
            (
                ConsumptionError::Checkpoint(CheckpointError::Exhausted {
                    partition_group: "g".to_string(),
                    attempts: 3,
                    last: StoreError::Unavailable {
                        reason: "down".to_string(),
                    },
                }),
                ErrorKind::CheckpointWriteTransient,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected, "kind mismatch for {:?}", error);
        }
    }

    #[test]
    fn test_exhausted_retries_are_fatal() {
        let error = ConsumptionError::RetriesExhausted {
            attempts: 5,
            last: Box::new(ConsumptionError::TransientFetch(SourceError::transient(
                "connection reset",
            ))),
        };

        assert_eq!(error.kind(), ErrorKind::FatalConsumption);
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("5 consecutive transient errors"));
    }

    #[test]
    fn test_checkpoint_error_transience() {
        let exhausted = CheckpointError::Exhausted {
            partition_group: "g".to_string(),
            attempts: 2,
            last: StoreError::Timeout(Duration::from_millis(10)),
        };
        assert!(exhausted.is_transient());

        let corrupt = CheckpointError::CorruptRecord(CorruptOffset {
            raw: "x".to_string(),
            reason: "bad".to_string(),
        });
        assert!(!corrupt.is_transient());
    }

    #[test]
    fn test_error_chain_display() {
        let inner_error = ConfigError::MissingField {
            field: "bootstrap_servers".to_string(),
        };
        let outer_error = ConsumptionError::Config(inner_error);

        let error_string = outer_error.to_string();
        assert!(error_string.contains("Configuration error"));
        assert!(error_string.contains("Missing required field: bootstrap_servers"));
    }
}
