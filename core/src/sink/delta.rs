use std::sync::Arc;

use arrow::array::{ArrayRef, BinaryArray, StringArray};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use deltalake::kernel::transaction::{CommitBuilder, CommitProperties};
use deltalake::kernel::{Action, Add, DataType, StructField};
use deltalake::protocol::{DeltaOperation, SaveMode};
use deltalake::writer::{DeltaWriter, RecordBatchWriter};
use deltalake::{DeltaOps, DeltaTable};
use tracing::{info, warn};

use crate::config::DeltaOptions;
use crate::errors::SegmentError;
use crate::offset::StreamOffset;
use crate::sink::{Segment, SegmentBuilder, SegmentRejected};

/// Writes segments to a Delta table with the columns `partition_group`,
/// `offset` and `payload`.
///
/// `build` writes a segment's parquet files without committing them, so they
/// are durable but not part of any table version. `publish` commits every
/// staged file in a single append. Discarded files are left for vacuum.
pub struct DeltaSegmentBuilder {
    options: DeltaOptions,
    schema: Arc<ArrowSchema>,
    table: Option<DeltaTable>,
    staged: Vec<Add>,
    staged_segments: usize,
}

impl DeltaSegmentBuilder {
    pub fn new(options: DeltaOptions) -> Self {
        let schema = ArrowSchema::new(vec![
            Field::new("partition_group", ArrowDataType::Utf8, false),
            Field::new("offset", ArrowDataType::Utf8, false),
            Field::new("payload", ArrowDataType::Binary, true),
        ]);
        Self {
            options,
            schema: Arc::new(schema),
            table: None,
            staged: Vec::new(),
            staged_segments: 0,
        }
    }

    /// Commits the staged files as one append.
    pub async fn publish(&mut self) -> Result<usize, SegmentError> {
        if self.staged_segments == 0 {
            return Ok(0);
        }
        let mut table = self.ensure_table_exists().await?;
        let result = self.commit_staged(&mut table).await;
        self.table = Some(table);

        let version = result?;
        let published = std::mem::take(&mut self.staged_segments);
        info!(
            table = %self.options.table_name,
            files = self.staged.len(),
            segments = published,
            version,
            "Published staged segments"
        );
        self.staged.clear();
        Ok(published)
    }

    pub fn discard(&mut self) -> usize {
        if self.staged_segments > 0 {
            warn!(
                table = %self.options.table_name,
                files = self.staged.len(),
                segments = self.staged_segments,
                "Discarding staged segments"
            );
        }
        self.staged.clear();
        std::mem::take(&mut self.staged_segments)
    }

    async fn commit_staged(&self, table: &mut DeltaTable) -> Result<i64, SegmentError> {
        let commit_error = |e: deltalake::DeltaTableError| SegmentError::Write {
            reason: e.to_string(),
        };
        let actions: Vec<Action> = self.staged.iter().cloned().map(Action::Add).collect();
        let operation = DeltaOperation::Write {
            mode: SaveMode::Append,
            partition_by: None,
            predicate: None,
        };

        let snapshot = table.snapshot().map_err(commit_error)?;
        let version = CommitBuilder::from(CommitProperties::default())
            .with_actions(actions)
            .build(Some(snapshot), table.log_store(), operation)
            .await
            .map_err(commit_error)?
            .version();
        table.update().await.map_err(commit_error)?;
        Ok(version)
    }

    /// Writes the batch as parquet files under the table and returns their
    /// uncommitted add actions.
    async fn stage(table: &DeltaTable, batch: RecordBatch) -> Result<Vec<Add>, SegmentError> {
        let write_error = |e: deltalake::DeltaTableError| SegmentError::Write {
            reason: e.to_string(),
        };
        let mut writer = RecordBatchWriter::for_table(table).map_err(write_error)?;
        writer.write(batch).await.map_err(write_error)?;
        writer.flush().await.map_err(write_error)
    }

    async fn ensure_table_exists(&mut self) -> Result<DeltaTable, SegmentError> {
        if let Some(table) = self.table.take() {
            return Ok(table);
        }

        let uri = &self.options.table_uri;
        match deltalake::open_table(uri).await {
            Ok(table) => {
                info!("Delta table exists at: {}", uri);
                Ok(table)
            }
            Err(_) => {
                info!("Creating new Delta table at: {}", uri);
                self.create_table().await
            }
        }
    }

    async fn create_table(&self) -> Result<DeltaTable, SegmentError> {
        let uri = &self.options.table_uri;
        if !uri.contains("://") {
            tokio::fs::create_dir_all(uri)
                .await
                .map_err(|e| SegmentError::TableLoad {
                    path: uri.clone(),
                    reason: e.to_string(),
                })?;
        }

        let columns = vec![
            StructField::new("partition_group", DataType::STRING, false),
            StructField::new("offset", DataType::STRING, false),
            StructField::new("payload", DataType::BINARY, true),
        ];

        let table = DeltaOps::try_from_uri(uri)
            .await
            .map_err(|e| SegmentError::TableLoad {
                path: uri.clone(),
                reason: e.to_string(),
            })?
            .create()
            .with_table_name(&self.options.table_name)
            .with_columns(columns)
            .await
            .map_err(|e| SegmentError::TableLoad {
                path: uri.clone(),
                reason: e.to_string(),
            })?;

        info!("Successfully created Delta table: {}", self.options.table_name);
        Ok(table)
    }

    fn to_record_batch<O: StreamOffset>(&self, segment: &Segment<O>) -> Result<RecordBatch, SegmentError> {
        let groups = StringArray::from(vec![segment.partition_group.as_str(); segment.len()]);
        let offsets = StringArray::from(
            segment
                .messages
                .iter()
                .map(|m| m.offset.to_string())
                .collect::<Vec<_>>(),
        );
        let payloads = BinaryArray::from_iter_values(segment.messages.iter().map(|m| m.payload.as_slice()));

        let columns: Vec<ArrayRef> = vec![Arc::new(groups), Arc::new(offsets), Arc::new(payloads)];
        RecordBatch::try_new(self.schema.clone(), columns).map_err(|e| SegmentError::Schema {
            reason: e.to_string(),
        })
    }
}

impl<O: StreamOffset> SegmentBuilder<O> for DeltaSegmentBuilder {
    async fn build(&mut self, segment: Segment<O>) -> Result<(), SegmentRejected<O>> {
        let batch = match self.to_record_batch(&segment) {
            Ok(batch) => batch,
            Err(error) => return Err(SegmentRejected { segment, error }),
        };
        let table = match self.ensure_table_exists().await {
            Ok(table) => table,
            Err(error) => return Err(SegmentRejected { segment, error }),
        };

        let staged = Self::stage(&table, batch).await;
        self.table = Some(table);
        match staged {
            Ok(adds) => {
                info!(
                    partition_group = %segment.partition_group,
                    messages = segment.len(),
                    end_offset = %segment.end_offset,
                    files = adds.len(),
                    "Staged segment in Delta table"
                );
                self.staged.extend(adds);
                self.staged_segments += 1;
                Ok(())
            }
            Err(error) => Err(SegmentRejected { segment, error }),
        }
    }

    async fn publish(&mut self) -> Result<usize, SegmentError> {
        DeltaSegmentBuilder::publish(self).await
    }

    fn discard(&mut self) -> usize {
        DeltaSegmentBuilder::discard(self)
    }
}
