use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    /// Identity written into checkpoint records this process commits.
    pub replica_id: String,
    pub metadata: MetadataConfig,
    pub partition_groups: Vec<PartitionGroupConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetadataConfig {
    Memory,
    File { path: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionGroupConfig {
    pub id: String,
    /// Used only when no checkpoint has been stored for the group yet.
    #[serde(default)]
    pub start_offset: Option<String>,
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum SourceConfig {
    Kafka(KafkaOptions),
    Memory(MemoryOptions),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topic: String,
    pub partition: i32,
    pub group_id: Option<String>,
    /// Commit checkpointed offsets back to the broker for `group_id`.
    #[serde(default)]
    pub commit_offsets: bool,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub max_poll_records: Option<u32>,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
}

fn default_linger_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryOptions {
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub sealed: bool,
    #[serde(default = "default_memory_batch")]
    pub max_batch_size: usize,
}

fn default_memory_batch() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum SinkConfig {
    Delta(DeltaOptions),
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeltaOptions {
    pub table_uri: String,
    pub table_name: String,
}

/// Tuning of a single consumption session. Every field has a default, so a
/// partition group may omit the whole section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub fetch_timeout_ms: u64,
    pub idle_fetch_timeout_ms: u64,
    /// Extra time a fetch may overrun its timeout before the session gives up
    /// on the call and counts it as a transient error.
    pub fetch_grace_ms: u64,
    pub max_consecutive_empty_fetches: u32,
    pub idle_after_ms: Option<u64>,
    pub checkpoint_threshold_bytes: Option<usize>,
    pub checkpoint_threshold_rows: Option<usize>,
    pub checkpoint_threshold_millis: Option<u64>,
    pub catch_up_deadline_ms: Option<u64>,
    pub max_transient_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub checkpoint_timeout_ms: u64,
    pub checkpoint_max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 5000,
            idle_fetch_timeout_ms: 30000,
            fetch_grace_ms: 1000,
            max_consecutive_empty_fetches: 10,
            idle_after_ms: None,
            checkpoint_threshold_bytes: Some(64 * 1024 * 1024),
            checkpoint_threshold_rows: Some(100_000),
            checkpoint_threshold_millis: Some(60_000),
            catch_up_deadline_ms: None,
            max_transient_retries: 5,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 10_000,
            checkpoint_timeout_ms: 5000,
            checkpoint_max_retries: 3,
        }
    }
}

impl SessionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_fetch_timeout_ms)
    }

    pub fn fetch_grace(&self) -> Duration {
        Duration::from_millis(self.fetch_grace_ms)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_ms == 0 || self.idle_fetch_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "fetch timeouts must be greater than zero".to_string(),
            });
        }
        if self.checkpoint_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "checkpoint_timeout_ms must be greater than zero".to_string(),
            });
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "retry_backoff_base_ms ({}) exceeds retry_backoff_max_ms ({})",
                    self.retry_backoff_base_ms, self.retry_backoff_max_ms
                ),
            });
        }
        if self.checkpoint_threshold_bytes.is_none()
            && self.checkpoint_threshold_rows.is_none()
            && self.checkpoint_threshold_millis.is_none()
        {
            return Err(ConfigError::ValidationFailed {
                reason: "at least one checkpoint threshold must be set".to_string(),
            });
        }
        Ok(())
    }
}

pub fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path))?,
        None => IngestConfig::from_env().context("Failed to load config from environment")?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var("INGEST_CONFIG").map_err(|_| ConfigError::MissingField {
            field: "INGEST_CONFIG".to_string(),
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replica_id.is_empty() {
            return Err(ConfigError::MissingField {
                field: "replica_id".to_string(),
            });
        }
        if self.partition_groups.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one partition group must be configured".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.partition_groups {
            if group.id.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "partition_groups[].id".to_string(),
                });
            }
            if !seen.insert(group.id.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    reason: format!("Duplicate partition group id {}", group.id),
                });
            }
            if let SourceConfig::Kafka(options) = &group.source {
                if options.bootstrap_servers.is_empty() {
                    return Err(ConfigError::ValidationFailed {
                        reason: "Kafka bootstrap servers cannot be empty".to_string(),
                    });
                }
                if options.topic.is_empty() {
                    return Err(ConfigError::ValidationFailed {
                        reason: "Kafka topic cannot be empty".to_string(),
                    });
                }
            }
            if let SinkConfig::Delta(options) = &group.sink {
                if options.table_name.is_empty() {
                    return Err(ConfigError::ValidationFailed {
                        reason: "Table name cannot be empty".to_string(),
                    });
                }
            }
            group.session.validate()?;
        }
        Ok(())
    }
}
