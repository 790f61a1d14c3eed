pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod offset;
pub mod retry;
pub mod session;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use checkpoint::{CheckpointCoordinator, CheckpointOutcome};
pub use config::IngestConfig;
pub use errors::{ConsumptionError, ErrorKind, Result};
pub use ingestor::Ingestor;
pub use offset::{LongOffset, StreamOffset};
pub use session::{ConsumptionSession, SessionReport, SessionState, StopHandle};
