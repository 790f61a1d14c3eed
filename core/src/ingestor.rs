use std::sync::Arc;

use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info};

use crate::checkpoint::CheckpointCoordinator;
use crate::checkpoint::store::MetadataBackend;
use crate::config::{IngestConfig, PartitionGroupConfig};
use crate::errors::{self, CheckpointError, ConsumptionError};
use crate::offset::{LongOffset, StreamOffset};
use crate::session::{ConsumptionSession, SessionReport, SessionState, StopHandle};
use crate::telemetry::SessionMetrics;
use crate::sink::SegmentSink;
use crate::source::StreamSource;

pub type IngestSession = ConsumptionSession<StreamSource, SegmentSink, MetadataBackend>;

/// Stops every session of an [`Ingestor`]. Cloneable so a signal handler can
/// hold it while the ingestor runs.
#[derive(Clone)]
pub struct ShutdownHandle {
    handles: Vec<StopHandle>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }
}

/// The ingestor wires one consumption session per configured partition group
/// to a shared metadata store and runs them concurrently.
pub struct Ingestor {
    replica_id: String,
    store: Arc<MetadataBackend>,
    sessions: Vec<IngestSession>,
}

impl Ingestor {
    pub async fn new(config: IngestConfig) -> errors::Result<Self> {
        config.validate()?;

        let store = Arc::new(
            MetadataBackend::from_config(&config.metadata)
                .await
                .map_err(CheckpointError::from)?,
        );
        let sessions = config
            .partition_groups
            .iter()
            .map(|group| Self::session(&config.replica_id, &store, group))
            .collect::<errors::Result<Vec<_>>>()?;

        info!(
            replica_id = %config.replica_id,
            partition_groups = sessions.len(),
            "Ingestor configured"
        );
        Ok(Self {
            replica_id: config.replica_id,
            store,
            sessions,
        })
    }

    fn session(
        replica_id: &str,
        store: &Arc<MetadataBackend>,
        group: &PartitionGroupConfig,
    ) -> errors::Result<IngestSession> {
        let start_offset = match group.start_offset.as_deref() {
            Some(raw) => LongOffset::parse(raw)?,
            None => LongOffset(0),
        };
        let consumer = StreamSource::from_config(&group.source).map_err(ConsumptionError::Fatal)?;
        let builder = SegmentSink::from_config(&group.sink);
        let coordinator =
            CheckpointCoordinator::from_session_config(store.clone(), replica_id, &group.session);

        Ok(ConsumptionSession::new(
            group.id.clone(),
            consumer,
            builder,
            coordinator,
            group.session.clone(),
            start_offset,
        ))
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn metadata_store(&self) -> Arc<MetadataBackend> {
        self.store.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            handles: self.sessions.iter().map(IngestSession::stop_handle).collect(),
        }
    }

    /// Runs every session on its own task and waits until all of them have
    /// stopped or failed. A task that panics or is cancelled yields a
    /// `Failed` report.
    pub async fn run(self) -> Vec<SessionReport<LongOffset>> {
        let tasks = self
            .sessions
            .into_iter()
            .map(|session| {
                let partition_group = session.partition_group().to_string();
                let start = *session.current_offset();
                (partition_group, start, tokio::spawn(session.run()))
            })
            .collect();
        collect_reports(tasks).await
    }
}

type SessionTask = (String, LongOffset, JoinHandle<SessionReport<LongOffset>>);

async fn collect_reports(tasks: Vec<SessionTask>) -> Vec<SessionReport<LongOffset>> {
    let mut groups = Vec::with_capacity(tasks.len());
    let mut handles = Vec::with_capacity(tasks.len());
    for (partition_group, start, handle) in tasks {
        groups.push((partition_group, start));
        handles.push(handle);
    }

    groups
        .into_iter()
        .zip(join_all(handles).await)
        .map(|((partition_group, start), joined)| match joined {
            Ok(report) => report,
            Err(e) => aborted_report(partition_group, start, e),
        })
        .collect()
}

fn aborted_report(partition_group: String, start: LongOffset, e: JoinError) -> SessionReport<LongOffset> {
    error!(partition_group = %partition_group, "Session task aborted: {}", e);
    SessionReport {
        partition_group,
        state: SessionState::Failed,
        error: Some(ConsumptionError::Aborted {
            reason: e.to_string(),
        }),
        current_offset: start,
        last_checkpointed_offset: None,
        transitions: vec![SessionState::Failed],
        metrics: SessionMetrics::default(),
    }
}
