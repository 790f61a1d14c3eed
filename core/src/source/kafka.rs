use std::collections::HashMap;
use std::time::Duration;

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::SourceError;
use crate::offset::LongOffset;
use crate::source::{MessageBatch, PartitionConsumer, SourceCapabilities, StreamMessage};

/// Consumes one Kafka partition by explicit assignment.
///
/// `start` builds the client and assigns the partition at the requested
/// offset. `checkpoint` commits the offset to the broker when a consumer group
/// is configured with `commit_offsets`, and is a no-op otherwise.
pub struct KafkaPartitionConsumer {
    options: KafkaOptions,
    consumer: Option<StreamConsumer>,
    /// next offset the client will hand out, if assigned
    position: Option<i64>,
    closed: bool,
}

impl KafkaPartitionConsumer {
    pub fn new(options: KafkaOptions) -> Self {
        Self {
            options,
            consumer: None,
            position: None,
            closed: false,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let config = &self.options;
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", config.group_id.as_deref().unwrap_or("consume-core"))
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.auto_offset_reset.as_deref().unwrap_or("earliest"));

        if let Some(timeout) = config.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(security_protocol) = &config.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &config.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &config.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        client_config
    }

    fn assign(&mut self, offset: i64) -> Result<(), SourceError> {
        if self.consumer.is_none() {
            let consumer: StreamConsumer = self
                .client_config()
                .create()
                .map_err(|e| classify("create consumer", e))?;
            self.consumer = Some(consumer);
        }
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SourceError::fatal("kafka consumer missing after creation"))?;

        let mut assignment = TopicPartitionList::with_capacity(1);
        assignment
            .add_partition_offset(&self.options.topic, self.options.partition, Offset::Offset(offset))
            .map_err(|e| classify("build assignment", e))?;
        consumer
            .assign(&assignment)
            .map_err(|e| classify("assign partition", e))?;

        self.position = Some(offset);
        info!(
            topic = %self.options.topic,
            partition = self.options.partition,
            offset,
            "Assigned Kafka partition"
        );
        Ok(())
    }
}

impl PartitionConsumer for KafkaPartitionConsumer {
    type Offset = LongOffset;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            prepares_on_start: true,
            checkpoints_on_source: self.options.commit_offsets && self.options.group_id.is_some(),
        }
    }

    async fn start(&mut self, offset: &LongOffset) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::fatal("start on a closed consumer"));
        }
        if self.position == Some(offset.value()) {
            return Ok(());
        }
        self.assign(offset.value())
    }

    async fn fetch(
        &mut self,
        start: &LongOffset,
        timeout: Duration,
    ) -> Result<MessageBatch<LongOffset>, SourceError> {
        if self.closed {
            return Err(SourceError::fatal("fetch on a closed consumer"));
        }
        if self.position != Some(start.value()) {
            self.assign(start.value())?;
        }

        let max_batch = self.options.max_poll_records.unwrap_or(500).max(1) as usize;
        let linger = Duration::from_millis(self.options.linger_ms);
        let deadline = Instant::now() + timeout;
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SourceError::fatal("fetch before the partition was assigned"))?;

        let mut messages = Vec::new();
        while messages.len() < max_batch {
            // once data has arrived, only wait `linger` for more
            let wait_until = if messages.is_empty() {
                deadline
            } else {
                deadline.min(Instant::now() + linger)
            };
            match timeout_at(wait_until, consumer.recv()).await {
                Ok(Ok(message)) => {
                    if message.offset() < start.value() {
                        debug!(offset = message.offset(), "Skipping message before fetch offset");
                        continue;
                    }
                    messages.push(convert_message(&message));
                }
                Ok(Err(e)) => {
                    let err = classify("consume", e);
                    if messages.is_empty() || err.is_fatal() {
                        return Err(err);
                    }
                    warn!("Error receiving message, returning partial batch: {}", err);
                    break;
                }
                Err(_) => break,
            }
        }

        let next = messages
            .last()
            .map(|m: &StreamMessage<LongOffset>| m.offset.next())
            .unwrap_or(*start);
        self.position = Some(next.value());

        if !messages.is_empty() {
            debug!(
                count = messages.len(),
                partition = self.options.partition,
                "Consumed batch of messages"
            );
        }
        Ok(MessageBatch::new(messages, next))
    }

    async fn checkpoint(&mut self, last: &LongOffset) -> Result<LongOffset, SourceError> {
        if !self.capabilities().checkpoints_on_source {
            return Ok(*last);
        }
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| SourceError::transient("checkpoint before the partition was assigned"))?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.options.topic, self.options.partition, Offset::Offset(last.value()))
            .map_err(|e| classify("build commit", e))?;
        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| classify("commit offsets", e))?;

        debug!(
            offset = last.value(),
            partition = self.options.partition,
            "Committed offset to broker"
        );
        Ok(*last)
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.unassign() {
                warn!("Failed to unassign Kafka partition on close: {}", e);
            }
        }
        self.position = None;
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> StreamMessage<LongOffset> {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    StreamMessage {
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        offset: LongOffset(message.offset()),
        headers,
    }
}

/// Maps client errors onto the transient/fatal split the session acts on.
pub(crate) fn classify(operation: &str, err: KafkaError) -> SourceError {
    let fatal = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownTopic
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::Fatal
        )
    ) || matches!(err, KafkaError::ClientCreation(_));

    let reason = format!("{} failed: {}", operation, err);
    if fatal {
        SourceError::Fatal {
            reason,
            source: Some(Box::new(err)),
        }
    } else {
        SourceError::Transient {
            reason,
            source: Some(Box::new(err)),
        }
    }
}
