mod buffer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::store::MetadataStore;
use crate::checkpoint::{CheckpointCoordinator, CheckpointOutcome};
use crate::config::SessionConfig;
use crate::errors::{ConsumptionError, ErrorKind, SourceError};
use crate::retry::RetryPolicy;
use crate::session::buffer::SegmentBuffer;
use crate::sink::{Segment, SegmentBuilder};
use crate::source::{ConsumerGuard, MessageBatch, PartitionConsumer};
use crate::telemetry::SessionMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Initializing,
    Consuming,
    CatchingUp,
    IdleAtHead,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initializing => "INITIALIZING",
            SessionState::Consuming => "CONSUMING",
            SessionState::CatchingUp => "CATCHING_UP",
            SessionState::IdleAtHead => "IDLE_AT_HEAD",
            SessionState::Stopping => "STOPPING",
            SessionState::Stopped => "STOPPED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Requests a session to stop. The session notices it before its next fetch,
/// so within one fetch timeout.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// What a session leaves behind once it reaches `Stopped` or `Failed`.
#[derive(Debug)]
pub struct SessionReport<O> {
    pub partition_group: String,
    pub state: SessionState,
    pub error: Option<ConsumptionError>,
    pub current_offset: O,
    pub last_checkpointed_offset: Option<O>,
    /// Every state entered, in order, starting with `Initializing`.
    pub transitions: Vec<SessionState>,
    pub metrics: SessionMetrics,
}

impl<O> SessionReport<O> {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(ConsumptionError::kind)
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    pub fn times_entered(&self, state: SessionState) -> usize {
        self.transitions.iter().filter(|s| **s == state).count()
    }
}

enum FetchOutcome<O> {
    Batch(MessageBatch<O>),
    Failed(SourceError),
    /// The adapter did not return within its timeout plus grace.
    Overrun(Duration),
}

/// Consumes one partition group: fetches, buffers, hands completed buffers to
/// the segment builder and checkpoints their resume offsets.
///
/// All state is owned by the session and mutated from a single task. Replicas
/// of the same partition group interact only through the coordinator's store.
pub struct ConsumptionSession<C: PartitionConsumer, B, S> {
    partition_group: String,
    config: SessionConfig,
    consumer: ConsumerGuard<C>,
    builder: B,
    coordinator: CheckpointCoordinator<S>,
    retry: RetryPolicy,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,

    state: SessionState,
    current_offset: C::Offset,
    last_checkpointed_offset: Option<C::Offset>,
    consecutive_empty_fetches: u32,
    consecutive_timeouts: u32,
    consecutive_failures: u32,
    consecutive_checkpoint_failures: u32,
    unpublished_segments: usize,
    buffer: SegmentBuffer<C::Offset>,
    catch_up_deadline: Option<Instant>,
    checkpoint_retry_at: Option<Instant>,
    last_data_at: Instant,

    transitions: Vec<SessionState>,
    metrics: SessionMetrics,
}

impl<C, B, S> ConsumptionSession<C, B, S>
where
    C: PartitionConsumer,
    B: SegmentBuilder<C::Offset>,
    S: MetadataStore,
{
    /// `start_offset` is used only when no checkpoint is stored for the group.
    pub fn new(
        partition_group: impl Into<String>,
        consumer: C,
        builder: B,
        coordinator: CheckpointCoordinator<S>,
        config: SessionConfig,
        start_offset: C::Offset,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            partition_group: partition_group.into(),
            retry: RetryPolicy::from_config(&config),
            config,
            consumer: ConsumerGuard::new(consumer),
            builder,
            coordinator,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            state: SessionState::Initializing,
            current_offset: start_offset,
            last_checkpointed_offset: None,
            consecutive_empty_fetches: 0,
            consecutive_timeouts: 0,
            consecutive_failures: 0,
            consecutive_checkpoint_failures: 0,
            unpublished_segments: 0,
            buffer: SegmentBuffer::new(),
            catch_up_deadline: None,
            checkpoint_retry_at: None,
            last_data_at: Instant::now(),
            transitions: vec![SessionState::Initializing],
            metrics: SessionMetrics::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn partition_group(&self) -> &str {
        &self.partition_group
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_offset(&self) -> &C::Offset {
        &self.current_offset
    }

    /// Runs the session until it stops or fails. Never panics on source or
    /// store errors: a failure is reported as `Failed` plus the error.
    pub async fn run(mut self) -> SessionReport<C::Offset> {
        info!(
            partition_group = %self.partition_group,
            offset = %self.current_offset,
            "Starting consumption session"
        );

        let error = match self.drive().await {
            Ok(()) => None,
            Err(e) => {
                error!(
                    partition_group = %self.partition_group,
                    state = %self.state,
                    kind = ?e.kind(),
                    "Consumption session failed: {}",
                    e
                );
                self.consumer.close();
                self.transition(SessionState::Failed);
                Some(e)
            }
        };

        info!(
            partition_group = %self.partition_group,
            state = %self.state,
            offset = %self.current_offset,
            metrics = ?self.metrics,
            "Consumption session ended"
        );

        SessionReport {
            partition_group: std::mem::take(&mut self.partition_group),
            state: self.state,
            error,
            current_offset: self.current_offset.clone(),
            last_checkpointed_offset: self.last_checkpointed_offset.take(),
            transitions: std::mem::take(&mut self.transitions),
            metrics: std::mem::take(&mut self.metrics),
        }
    }

    async fn drive(&mut self) -> Result<(), ConsumptionError> {
        if !self.initialize().await? {
            return self.shutdown("stop requested during initialization").await;
        }

        loop {
            if self.stop_requested() {
                return self.shutdown("stop requested").await;
            }

            let timeout = if self.state == SessionState::IdleAtHead {
                self.config.idle_fetch_timeout()
            } else {
                self.config.fetch_timeout()
            };
            let start = self.current_offset.clone();

            match self.fetch_once(&start, timeout).await {
                FetchOutcome::Batch(batch) => {
                    batch.validate(&start)?;
                    self.consecutive_failures = 0;
                    let end_of_partition_group = batch.is_end_of_partition_group();
                    self.on_batch(batch);
                    if end_of_partition_group {
                        return self.shutdown("end of partition group").await;
                    }
                }
                FetchOutcome::Failed(e) if e.is_fatal() => return Err(ConsumptionError::Fatal(e)),
                FetchOutcome::Failed(e) => {
                    self.backoff(ConsumptionError::TransientFetch(e)).await?;
                }
                FetchOutcome::Overrun(limit) => {
                    self.consecutive_timeouts += 1;
                    self.metrics.fetch_overruns += 1;
                    let e = SourceError::transient(format!(
                        "fetch did not return within {:?} ({} in a row)",
                        limit, self.consecutive_timeouts
                    ));
                    self.backoff(ConsumptionError::TransientFetch(e)).await?;
                }
            }

            self.maybe_checkpoint().await?;
        }
    }

    /// Loads the stored checkpoint and starts the source. Returns `false` when
    /// a stop request arrives before the source has started.
    async fn initialize(&mut self) -> Result<bool, ConsumptionError> {
        let stored = self
            .coordinator
            .load::<C::Offset>(&self.partition_group)
            .await?;
        let resumed = stored.is_some();
        if let Some(offset) = stored {
            info!(
                partition_group = %self.partition_group,
                offset = %offset,
                "Resuming from stored checkpoint"
            );
            self.current_offset = offset.clone();
            self.last_checkpointed_offset = Some(offset);
        }

        let capabilities = self.consumer.capabilities();
        debug!(
            partition_group = %self.partition_group,
            prepares_on_start = capabilities.prepares_on_start,
            checkpoints_on_source = capabilities.checkpoints_on_source,
            "Source capabilities"
        );

        loop {
            if self.stop_requested() {
                return Ok(false);
            }
            let start = self.current_offset.clone();
            match self.consumer.start(&start).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(ConsumptionError::Fatal(e)),
                Err(e) => self.backoff(ConsumptionError::TransientFetch(e)).await?,
            }
        }
        self.consecutive_failures = 0;
        self.last_data_at = Instant::now();

        match (resumed, self.config.catch_up_deadline_ms) {
            (true, Some(ms)) => {
                self.catch_up_deadline = Some(Instant::now() + Duration::from_millis(ms));
                self.transition(SessionState::CatchingUp);
            }
            _ => self.transition(SessionState::Consuming),
        }
        Ok(true)
    }

    async fn fetch_once(&mut self, start: &C::Offset, timeout: Duration) -> FetchOutcome<C::Offset> {
        self.metrics.fetches += 1;
        let limit = timeout + self.config.fetch_grace();
        match tokio::time::timeout(limit, self.consumer.fetch(start, timeout)).await {
            Ok(Ok(batch)) => {
                self.consecutive_timeouts = 0;
                FetchOutcome::Batch(batch)
            }
            Ok(Err(e)) => {
                self.consecutive_timeouts = 0;
                FetchOutcome::Failed(e)
            }
            Err(_) => FetchOutcome::Overrun(limit),
        }
    }

    fn on_batch(&mut self, batch: MessageBatch<C::Offset>) {
        let now = Instant::now();
        let next = batch.offset_of_next_batch().clone();

        if batch.is_empty() {
            self.metrics.empty_fetches += 1;
            self.consecutive_empty_fetches += 1;
            self.current_offset = next;
            if matches!(self.state, SessionState::Consuming | SessionState::CatchingUp)
                && self.idle_threshold_exceeded(now)
            {
                debug!(
                    partition_group = %self.partition_group,
                    empty_fetches = self.consecutive_empty_fetches,
                    "No new data, switching to idle polling"
                );
                self.catch_up_deadline = None;
                self.transition(SessionState::IdleAtHead);
            }
            return;
        }

        self.metrics.messages += batch.len();
        self.metrics.bytes += batch.size_bytes() as u64;
        self.consecutive_empty_fetches = 0;
        self.last_data_at = now;
        self.current_offset = next;
        self.buffer.extend(batch.into_messages(), now);

        if self.state == SessionState::IdleAtHead {
            self.transition(SessionState::Consuming);
        }
    }

    fn idle_threshold_exceeded(&self, now: Instant) -> bool {
        self.consecutive_empty_fetches > self.config.max_consecutive_empty_fetches
            || self.config.idle_after_ms.is_some_and(|ms| {
                now.saturating_duration_since(self.last_data_at) >= Duration::from_millis(ms)
            })
    }

    async fn maybe_checkpoint(&mut self) -> Result<(), ConsumptionError> {
        let now = Instant::now();

        if self.state == SessionState::CatchingUp
            && self.catch_up_deadline.is_some_and(|deadline| now >= deadline)
        {
            info!(
                partition_group = %self.partition_group,
                offset = %self.current_offset,
                "Catch-up deadline reached, forcing checkpoint"
            );
            self.interruptible_exchange().await?;
            self.catch_up_deadline = None;
            self.transition(SessionState::Consuming);
            return Ok(());
        }

        let catching_up = self.state == SessionState::CatchingUp;
        let retry_due = self.checkpoint_retry_at.is_some_and(|at| now >= at);
        if self.buffer.is_full(&self.config, now, catching_up) || retry_due {
            self.interruptible_exchange().await?;
        }
        Ok(())
    }

    /// A checkpoint exchange whose retryable failure is left to the final
    /// checkpoint in `shutdown` once a stop has been requested.
    async fn interruptible_exchange(&mut self) -> Result<(), ConsumptionError> {
        match self.checkpoint_exchange().await {
            Err(e) if e.is_retryable() && self.stop_requested() => {
                debug!(
                    partition_group = %self.partition_group,
                    "Checkpoint interrupted by stop request: {}",
                    e
                );
                Ok(())
            }
            result => result,
        }
    }

    /// Stages the buffer with the segment builder, records the resume offset
    /// on the source and with the coordinator, then publishes the staged
    /// segments once the checkpoint is accepted.
    ///
    /// Checkpoint failures that can heal are logged and retried later; the
    /// in-memory offset and the staged segments are kept either way.
    async fn checkpoint_exchange(&mut self) -> Result<(), ConsumptionError> {
        let end = self.current_offset.clone();

        if !self.buffer.is_empty() {
            let segment = Segment {
                partition_group: self.partition_group.clone(),
                messages: self.buffer.take(),
                end_offset: end.clone(),
            };
            self.build_segment(segment).await?;
        }

        if self.last_checkpointed_offset.as_ref() == Some(&end) {
            self.checkpoint_retry_at = None;
            return self.publish_staged().await;
        }

        let confirmed = match self.consumer.checkpoint(&end).await {
            Ok(offset) => offset,
            Err(e) if e.is_fatal() => return Err(ConsumptionError::Fatal(e)),
            Err(e) => {
                warn!(
                    partition_group = %self.partition_group,
                    offset = %end,
                    "Source checkpoint failed, will retry: {}",
                    e
                );
                self.defer_checkpoint();
                return Ok(());
            }
        };
        if confirmed != end {
            return Err(ConsumptionError::OffsetRegression {
                context: "checkpoint",
                expected: end.to_string(),
                found: confirmed.to_string(),
            });
        }

        match self.coordinator.propose(&self.partition_group, &confirmed).await {
            Ok(CheckpointOutcome::Accepted(offset)) => {
                info!(
                    partition_group = %self.partition_group,
                    offset = %offset,
                    "Checkpoint committed"
                );
                self.metrics.checkpoints_accepted += 1;
                self.last_checkpointed_offset = Some(offset);
                self.checkpoint_retry_at = None;
                self.consecutive_checkpoint_failures = 0;
                self.publish_staged().await?;
            }
            Ok(CheckpointOutcome::Superseded { stored, committer }) => {
                self.metrics.checkpoints_superseded += 1;
                if stored > self.current_offset {
                    info!(
                        partition_group = %self.partition_group,
                        from = %self.current_offset,
                        to = %stored,
                        committer = %committer,
                        "Adopting checkpoint of another replica"
                    );
                    self.current_offset = stored.clone();
                }
                self.last_checkpointed_offset = Some(stored);
                self.checkpoint_retry_at = None;
                self.consecutive_checkpoint_failures = 0;
                let discarded = self.builder.discard();
                self.unpublished_segments = 0;
                self.metrics.segments_discarded += discarded;
                if discarded > 0 {
                    debug!(
                        partition_group = %self.partition_group,
                        discarded,
                        "Dropped staged segments covered by the adopted checkpoint"
                    );
                }
            }
            Err(e) if e.is_transient() => {
                warn!(
                    partition_group = %self.partition_group,
                    offset = %confirmed,
                    "Checkpoint not persisted, keeping in-memory offset: {}",
                    e
                );
                self.defer_checkpoint();
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn defer_checkpoint(&mut self) {
        self.metrics.checkpoint_failures += 1;
        self.consecutive_checkpoint_failures =
            self.consecutive_checkpoint_failures.saturating_add(1);
        let attempt = self.consecutive_checkpoint_failures.min(16);
        self.checkpoint_retry_at = Some(Instant::now() + self.retry.ceiling(attempt));
    }

    /// Stages a segment with the builder, retrying the same segment on failure
    /// within the transient budget. Once a stop is requested a failed segment
    /// goes back into the buffer instead of being retried.
    async fn build_segment(&mut self, segment: Segment<C::Offset>) -> Result<(), ConsumptionError> {
        let mut segment = segment;
        loop {
            match self.builder.build(segment).await {
                Ok(()) => {
                    self.metrics.segments_built += 1;
                    self.unpublished_segments += 1;
                    self.consecutive_failures = 0;
                    return Ok(());
                }
                Err(rejected) => {
                    self.metrics.segment_failures += 1;
                    if self.stop_requested() {
                        self.buffer.restore(rejected.segment.messages, Instant::now());
                        return Err(ConsumptionError::Segment(rejected.error));
                    }
                    segment = rejected.segment;
                    self.backoff(ConsumptionError::Segment(rejected.error)).await?;
                }
            }
        }
    }

    /// Publishes staged segments, retrying within the transient budget unless
    /// a stop has been requested.
    async fn publish_staged(&mut self) -> Result<(), ConsumptionError> {
        if self.unpublished_segments == 0 {
            return Ok(());
        }
        loop {
            match self.builder.publish().await {
                Ok(published) => {
                    self.metrics.segments_published += published;
                    self.unpublished_segments = 0;
                    self.consecutive_failures = 0;
                    return Ok(());
                }
                Err(e) if self.stop_requested() => return Err(ConsumptionError::Segment(e)),
                Err(e) => self.backoff(ConsumptionError::Segment(e)).await?,
            }
        }
    }

    /// Counts a transient error and sleeps before the retry, or escalates once
    /// the budget is spent.
    async fn backoff(&mut self, err: ConsumptionError) -> Result<(), ConsumptionError> {
        self.consecutive_failures += 1;
        self.metrics.transient_errors += 1;
        if self.consecutive_failures > self.config.max_transient_retries {
            return Err(ConsumptionError::RetriesExhausted {
                attempts: self.consecutive_failures,
                last: Box::new(err),
            });
        }

        let delay = self.retry.time_until_next_retry(self.consecutive_failures - 1);
        warn!(
            partition_group = %self.partition_group,
            "{}, retrying in {:?} (attempt {}/{})",
            err,
            delay,
            self.consecutive_failures,
            self.config.max_transient_retries
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.stop_rx.wait_for(|stopped| *stopped) => {}
        }
        Ok(())
    }

    /// Final checkpoint, best effort, then release the source.
    async fn shutdown(&mut self, reason: &str) -> Result<(), ConsumptionError> {
        info!(
            partition_group = %self.partition_group,
            offset = %self.current_offset,
            reason,
            "Stopping consumption session"
        );
        let started = self.state != SessionState::Initializing;
        self.transition(SessionState::Stopping);

        let uncommitted = self.last_checkpointed_offset.as_ref() != Some(&self.current_offset);
        if started && (!self.buffer.is_empty() || uncommitted || self.unpublished_segments > 0) {
            if let Err(e) = self.checkpoint_exchange().await {
                warn!(
                    partition_group = %self.partition_group,
                    "Final checkpoint failed: {}",
                    e
                );
            }
        }

        self.consumer.close();
        self.transition(SessionState::Stopped);
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        debug!(
            partition_group = %self.partition_group,
            from = %self.state,
            to = %next,
            "Session state change"
        );
        self.state = next;
        self.transitions.push(next);
    }
}
