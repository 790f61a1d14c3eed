pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::store::MetadataStore;
use crate::config::SessionConfig;
use crate::errors::{CheckpointError, CorruptOffset, StoreError};
use crate::offset::StreamOffset;
use crate::retry::RetryPolicy;

/// Bound on back-to-back lost compare-and-swap races before a proposal is
/// reported as failed. Losing a race is not a store failure, so it does not
/// count against the retry budget.
const MAX_CAS_CONFLICTS: u32 = 32;

/// The durable progress of one partition group, as stored in shared metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub partition_group_id: String,
    pub offset: String,
    pub committer: String,
    pub commit_timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Parses a stored record and checks that it belongs to `partition_group`.
    fn decode(raw: &str, partition_group: &str) -> Result<Self, CorruptOffset> {
        let record: Self = serde_json::from_str(raw).map_err(|e| CorruptOffset {
            raw: raw.to_string(),
            reason: format!("invalid checkpoint record: {}", e),
        })?;
        if record.partition_group_id != partition_group {
            return Err(CorruptOffset {
                raw: raw.to_string(),
                reason: format!(
                    "record of partition group '{}' stored under the key of '{}'",
                    record.partition_group_id, partition_group
                ),
            });
        }
        Ok(record)
    }

    pub fn offset<O: StreamOffset>(&self) -> Result<O, CorruptOffset> {
        O::parse(&self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome<O> {
    /// The proposal is now the stored checkpoint and this replica its committer.
    Accepted(O),
    /// Another replica already stored a later offset.
    Superseded { stored: O, committer: String },
}

/// Serializes checkpoint writes for partition groups across replicas.
///
/// Every write is a single compare-and-swap against the value read just
/// before, so a stored offset can only move forward no matter how many
/// replicas propose concurrently.
pub struct CheckpointCoordinator<S> {
    store: Arc<S>,
    replica_id: String,
    retry: RetryPolicy,
    max_retries: u32,
    call_timeout: Duration,
}

impl<S: MetadataStore> CheckpointCoordinator<S> {
    pub fn new(store: Arc<S>, replica_id: impl Into<String>) -> Self {
        Self {
            store,
            replica_id: replica_id.into(),
            retry: RetryPolicy::default(),
            max_retries: 3,
            call_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_session_config(
        store: Arc<S>,
        replica_id: impl Into<String>,
        config: &SessionConfig,
    ) -> Self {
        Self::new(store, replica_id)
            .with_retry(RetryPolicy::from_config(config), config.checkpoint_max_retries)
            .with_call_timeout(config.checkpoint_timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy, max_retries: u32) -> Self {
        self.retry = retry;
        self.max_retries = max_retries;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn key(partition_group: &str) -> String {
        format!("checkpoints/{}", partition_group)
    }

    /// Reads the stored record of a partition group, retrying transient store
    /// failures.
    pub async fn read_record(
        &self,
        partition_group: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let key = Self::key(partition_group);
        let raw = self
            .with_retries(partition_group, || self.call(self.store.read(&key)))
            .await?;
        Ok(raw
            .as_deref()
            .map(|raw| CheckpointRecord::decode(raw, partition_group))
            .transpose()?)
    }

    /// The stored offset of a partition group, if any.
    pub async fn load<O: StreamOffset>(
        &self,
        partition_group: &str,
    ) -> Result<Option<O>, CheckpointError> {
        match self.read_record(partition_group).await? {
            Some(record) => Ok(Some(record.offset()?)),
            None => Ok(None),
        }
    }

    /// Proposes `offset` as the checkpoint of `partition_group`.
    ///
    /// Accepted when `offset` is at least the stored offset; otherwise the
    /// stored offset is returned so the caller can adopt it. Re-proposing the
    /// stored offset is accepted and leaves the offset unchanged.
    pub async fn propose<O: StreamOffset>(
        &self,
        partition_group: &str,
        offset: &O,
    ) -> Result<CheckpointOutcome<O>, CheckpointError> {
        let key = Self::key(partition_group);
        let mut failures = 0;
        let mut conflicts = 0;

        loop {
            match self.try_propose(&key, partition_group, offset).await {
                Ok(Some(outcome)) => {
                    match &outcome {
                        CheckpointOutcome::Accepted(o) => {
                            debug!(partition_group, offset = %o, "Checkpoint accepted")
                        }
                        CheckpointOutcome::Superseded { stored, committer } => info!(
                            partition_group,
                            proposed = %offset,
                            stored = %stored,
                            committer = %committer,
                            "Checkpoint superseded by another replica"
                        ),
                    }
                    return Ok(outcome);
                }
                Ok(None) => {
                    conflicts += 1;
                    if conflicts >= MAX_CAS_CONFLICTS {
                        return Err(CheckpointError::Exhausted {
                            partition_group: partition_group.to_string(),
                            attempts: conflicts,
                            last: StoreError::Unavailable {
                                reason: "lost every compare-and-swap race".to_string(),
                            },
                        });
                    }
                    debug!(partition_group, conflicts, "Lost compare-and-swap race, re-reading");
                }
                Err(CheckpointError::Store(e)) if e.is_transient() => {
                    failures += 1;
                    if failures > self.max_retries {
                        return Err(CheckpointError::Exhausted {
                            partition_group: partition_group.to_string(),
                            attempts: failures,
                            last: e,
                        });
                    }
                    let delay = self.retry.time_until_next_retry(failures - 1);
                    warn!(
                        partition_group,
                        "Checkpoint write failed: {}, retrying in {:?} (attempt {}/{})",
                        e,
                        delay,
                        failures,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One read + compare-and-swap round. `Ok(None)` means the value changed
    /// between the two calls.
    async fn try_propose<O: StreamOffset>(
        &self,
        key: &str,
        partition_group: &str,
        offset: &O,
    ) -> Result<Option<CheckpointOutcome<O>>, CheckpointError> {
        let raw = self.call(self.store.read(key)).await?;
        if let Some(current) = raw.as_deref() {
            let record = CheckpointRecord::decode(current, partition_group)?;
            let stored: O = record.offset()?;
            if *offset < stored {
                return Ok(Some(CheckpointOutcome::Superseded {
                    stored,
                    committer: record.committer,
                }));
            }
        }

        let record = CheckpointRecord {
            partition_group_id: partition_group.to_string(),
            offset: offset.to_string(),
            committer: self.replica_id.clone(),
            commit_timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&record).map_err(StoreError::from)?;

        if self
            .call(self.store.compare_and_swap(key, raw.as_deref(), &encoded))
            .await?
        {
            Ok(Some(CheckpointOutcome::Accepted(offset.clone())))
        } else {
            Ok(None)
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.call_timeout))?
    }

    async fn with_retries<T, F, Fut>(&self, partition_group: &str, mut op: F) -> Result<T, CheckpointError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures > self.max_retries {
                        return Err(CheckpointError::Exhausted {
                            partition_group: partition_group.to_string(),
                            attempts: failures,
                            last: e,
                        });
                    }
                    tokio::time::sleep(self.retry.time_until_next_retry(failures - 1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::store::InMemoryMetadataStore;
    use crate::offset::LongOffset;

    fn coordinator(
        store: &Arc<InMemoryMetadataStore>,
        replica: &str,
    ) -> CheckpointCoordinator<InMemoryMetadataStore> {
        CheckpointCoordinator::new(store.clone(), replica).with_retry(
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(40)),
            2,
        )
    }

    #[tokio::test]
    async fn test_first_proposal_is_accepted() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let coordinator = coordinator(&store, "replica-a");

        let outcome = coordinator.propose("g", &LongOffset(50)).await.unwrap();
        assert_eq!(outcome, CheckpointOutcome::Accepted(LongOffset(50)));

        let record = coordinator.read_record("g").await.unwrap().expect("record");
        assert_eq!(record.partition_group_id, "g");
        assert_eq!(record.offset, "50");
        assert_eq!(record.committer, "replica-a");
        assert_eq!(coordinator.load::<LongOffset>("g").await.unwrap(), Some(LongOffset(50)));
    }

    #[tokio::test]
    async fn test_regressing_proposal_is_superseded() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let a = coordinator(&store, "replica-a");
        let b = coordinator(&store, "replica-b");

        b.propose("g", &LongOffset(100)).await.unwrap();
        let outcome = a.propose("g", &LongOffset(60)).await.unwrap();

        assert_eq!(
            outcome,
            CheckpointOutcome::Superseded {
                stored: LongOffset(100),
                committer: "replica-b".to_string(),
            }
        );
        assert_eq!(a.load::<LongOffset>("g").await.unwrap(), Some(LongOffset(100)));
    }

    #[tokio::test]
    async fn test_repeated_proposal_is_idempotent() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let coordinator = coordinator(&store, "replica-a");

        let first = coordinator.propose("g", &LongOffset(7)).await.unwrap();
        let second = coordinator.propose("g", &LongOffset(7)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(coordinator.load::<LongOffset>("g").await.unwrap(), Some(LongOffset(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_exhausts_retries() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let coordinator = coordinator(&store, "replica-a");
        store.set_available(false);

        let err = coordinator.propose("g", &LongOffset(1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Exhausted { attempts: 3, .. }));
        assert!(err.is_transient());

        store.set_available(true);
        assert_eq!(
            coordinator.propose("g", &LongOffset(1)).await.unwrap(),
            CheckpointOutcome::Accepted(LongOffset(1))
        );
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let store = Arc::new(InMemoryMetadataStore::new());
        store.put(&CheckpointCoordinator::<InMemoryMetadataStore>::key("g"), "not json");
        let coordinator = coordinator(&store, "replica-a");

        let err = coordinator.load::<LongOffset>("g").await.unwrap_err();
        assert!(matches!(err, CheckpointError::CorruptRecord(_)));
        assert!(!err.is_transient());

        let record = CheckpointRecord {
            partition_group_id: "g".to_string(),
            offset: "twelve".to_string(),
            committer: "replica-x".to_string(),
            commit_timestamp: Utc::now(),
        };
        store.put(
            &CheckpointCoordinator::<InMemoryMetadataStore>::key("g"),
            &serde_json::to_string(&record).unwrap(),
        );
        assert!(matches!(
            coordinator.propose("g", &LongOffset(3)).await,
            Err(CheckpointError::CorruptRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_record_of_another_group_is_rejected() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let record = CheckpointRecord {
            partition_group_id: "orders/0".to_string(),
            offset: "100".to_string(),
            committer: "replica-b".to_string(),
            commit_timestamp: Utc::now(),
        };
        store.put(
            &CheckpointCoordinator::<InMemoryMetadataStore>::key("orders_0"),
            &serde_json::to_string(&record).unwrap(),
        );
        let coordinator = coordinator(&store, "replica-a");

        assert!(matches!(
            coordinator.load::<LongOffset>("orders_0").await,
            Err(CheckpointError::CorruptRecord(_))
        ));
        assert!(matches!(
            coordinator.propose("orders_0", &LongOffset(10)).await,
            Err(CheckpointError::CorruptRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_proposals_converge_to_max() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let mut handles = Vec::new();
        for (i, offset) in [30, 90, 10, 60, 75].into_iter().enumerate() {
            let coordinator = coordinator(&store, &format!("replica-{}", i));
            handles.push(tokio::spawn(async move {
                coordinator.propose("g", &LongOffset(offset)).await
            }));
        }
        for handle in handles {
            handle.await.expect("task panicked").expect("proposal failed");
        }

        let reader = coordinator(&store, "reader");
        assert_eq!(reader.load::<LongOffset>("g").await.unwrap(), Some(LongOffset(90)));
    }
}
