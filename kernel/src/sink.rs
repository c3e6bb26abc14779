//! Builders wiring the sink topology: partition routing, N write operators, one coordinator.
//!
//! The host runtime owns scheduling and checkpoint-barrier delivery; the builders only validate
//! the configuration, mint the initial commit user, and hand back the operator set. Parallelism
//! applies to writers; the coordinator always runs at parallelism 1.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::catalog::{Catalog, EmptyLockFactory, Identifier, LockFactory};
use crate::cdc::{CdcMultiplexChannelComputer, CdcMultiplexWriteOperator, SchemaChangeApplier};
use crate::channel::ChannelComputer;
use crate::committable::CommitKind;
use crate::committer::{
    CommittableStateManager, Committer, CommitterOperator, MultiTableCommitter,
    NoopCommittableStateManager, RestoreAndFailCommittableStateManager, TableCommitter,
};
use crate::schema::{BucketMode, TableSchema};
use crate::store::{FileStoreCommit, FileStoreWrite};
use crate::utils::require;
use crate::writer::WriteOperator;
use crate::{Error, SinkResult};

/// The host checkpointing guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointingMode {
    ExactlyOnce,
    AtLeastOnce,
}

/// Checkpoint configuration of the host job, validated by the builders.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub unaligned: bool,
    pub mode: CheckpointingMode,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unaligned: false,
            mode: CheckpointingMode::ExactlyOnce,
        }
    }
}

fn assert_checkpoint_configuration(config: &CheckpointConfig) -> SinkResult<()> {
    require!(
        !config.unaligned,
        Error::unsupported(
            "the sink does not support unaligned checkpoints; disable unaligned checkpointing"
        )
    );
    require!(
        config.mode == CheckpointingMode::ExactlyOnce,
        Error::unsupported(
            "the sink only supports the EXACTLY_ONCE checkpoint mode; set the checkpointing mode \
             to exactly-once"
        )
    );
    Ok(())
}

/// A built single-table sink: the channel computer for routing, the writer operators, and the
/// coordinator. The host drives their lifecycles.
#[derive(Debug)]
pub struct Sink {
    pub channel_computer: ChannelComputer,
    pub writers: Vec<WriteOperator>,
    pub committer: CommitterOperator,
}

/// Builder for the single-table sink.
pub struct SinkBuilder {
    table: Identifier,
    schema: TableSchema,
    store_write: Arc<dyn FileStoreWrite>,
    store_commit: Arc<dyn FileStoreCommit>,
    lock_factory: Arc<dyn LockFactory>,
    parallelism: usize,
    streaming: bool,
    checkpoint: CheckpointConfig,
    overwrite_partition: Option<Option<String>>,
    do_compaction: bool,
}

impl SinkBuilder {
    pub fn new(
        table: Identifier,
        schema: TableSchema,
        store_write: Arc<dyn FileStoreWrite>,
        store_commit: Arc<dyn FileStoreCommit>,
    ) -> Self {
        Self {
            table,
            schema,
            store_write,
            store_commit,
            lock_factory: EmptyLockFactory::new(),
            parallelism: 1,
            streaming: true,
            checkpoint: CheckpointConfig::default(),
            overwrite_partition: None,
            do_compaction: false,
        }
    }

    pub fn with_lock_factory(mut self, lock_factory: Arc<dyn LockFactory>) -> Self {
        self.lock_factory = lock_factory;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Batch jobs run without checkpoints; their committables are committed on completion and
    /// nothing is persisted for recovery.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_checkpoint_config(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Replace the named partition (or the whole table when `None`) instead of appending.
    pub fn with_overwrite(mut self, partition: Option<String>) -> Self {
        self.overwrite_partition = Some(partition);
        self
    }

    /// Also compact every written bucket at each checkpoint.
    pub fn with_compaction(mut self, do_compaction: bool) -> Self {
        self.do_compaction = do_compaction;
        self
    }

    pub fn build(self) -> SinkResult<Sink> {
        require!(
            self.parallelism > 0,
            Error::generic("sink parallelism must be positive")
        );
        let bucket_mode = self.schema.bucket_mode();
        require!(
            bucket_mode == BucketMode::Fixed,
            Error::unsupported(format!("Unsupported bucket mode: {bucket_mode:?}"))
        );
        let streaming_checkpoint_enabled = self.streaming && self.checkpoint.enabled;
        if streaming_checkpoint_enabled {
            assert_checkpoint_configuration(&self.checkpoint)?;
        }

        // Valid only for new jobs; recorded into writer and committer state on the first
        // checkpoint and recovered from there ever after.
        let initial_commit_user = Uuid::new_v4().to_string();
        debug!(table = %self.table, initial_commit_user, parallelism = self.parallelism, "building sink");

        let writers = (0..self.parallelism)
            .map(|index| {
                WriteOperator::new(
                    self.table.clone(),
                    self.store_write.clone(),
                    initial_commit_user.clone(),
                    index,
                    self.parallelism,
                )
                .with_compaction(self.do_compaction)
            })
            .collect();

        let committer: Box<dyn Committer> = Box::new(
            TableCommitter::new(self.table.clone(), self.store_commit, self.lock_factory)
                // Commit even empty file lists when streaming checkpoints are on: otherwise a
                // restart cannot tell whether the commit happened.
                .with_commit_empty(streaming_checkpoint_enabled),
        );
        let state_manager: Box<dyn CommittableStateManager> = if streaming_checkpoint_enabled {
            Box::new(RestoreAndFailCommittableStateManager::new())
        } else {
            Box::new(NoopCommittableStateManager::new())
        };
        let mut committer_operator = CommitterOperator::new(
            initial_commit_user,
            self.parallelism,
            committer,
            state_manager,
        );
        if let Some(partition) = self.overwrite_partition {
            committer_operator =
                committer_operator.with_commit_kind(CommitKind::Overwrite { partition });
        }

        Ok(Sink {
            channel_computer: ChannelComputer::new(self.parallelism),
            writers,
            committer: committer_operator,
        })
    }
}

/// A built multiplexed CDC sink: one writer/committer pair handling every table, plus the
/// parallelism-1 schema-apply stage.
#[derive(Debug)]
pub struct CdcMultiplexSink {
    pub channel_computer: CdcMultiplexChannelComputer,
    pub writers: Vec<CdcMultiplexWriteOperator>,
    pub schema_applier: SchemaChangeApplier,
    pub committer: CommitterOperator,
}

/// Builder for the multiplexed CDC sink handling tables discovered at runtime.
pub struct CdcMultiplexSinkBuilder {
    catalog: Arc<dyn Catalog>,
    store_write: Arc<dyn FileStoreWrite>,
    store_commit: Arc<dyn FileStoreCommit>,
    lock_factory: Arc<dyn LockFactory>,
    parallelism: usize,
    checkpoint: CheckpointConfig,
    default_num_buckets: u32,
}

impl CdcMultiplexSinkBuilder {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store_write: Arc<dyn FileStoreWrite>,
        store_commit: Arc<dyn FileStoreCommit>,
    ) -> Self {
        Self {
            catalog,
            store_write,
            store_commit,
            lock_factory: EmptyLockFactory::new(),
            parallelism: 1,
            checkpoint: CheckpointConfig::default(),
            default_num_buckets: 1,
        }
    }

    pub fn with_lock_factory(mut self, lock_factory: Arc<dyn LockFactory>) -> Self {
        self.lock_factory = lock_factory;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_checkpoint_config(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Bucket count for tables created from the CDC stream.
    pub fn with_default_num_buckets(mut self, default_num_buckets: u32) -> Self {
        self.default_num_buckets = default_num_buckets;
        self
    }

    pub fn build(self) -> SinkResult<CdcMultiplexSink> {
        require!(
            self.parallelism > 0,
            Error::generic("sink parallelism must be positive")
        );
        // The multiplexed sink is streaming by definition.
        require!(
            self.checkpoint.enabled,
            Error::unsupported("the multiplexed CDC sink requires checkpointing to be enabled")
        );
        assert_checkpoint_configuration(&self.checkpoint)?;

        let initial_commit_user = Uuid::new_v4().to_string();
        debug!(
            initial_commit_user,
            parallelism = self.parallelism,
            "building multiplexed CDC sink"
        );

        let writers = (0..self.parallelism)
            .map(|index| {
                CdcMultiplexWriteOperator::new(
                    self.catalog.clone(),
                    self.store_write.clone(),
                    initial_commit_user.clone(),
                    index,
                    self.parallelism,
                    self.default_num_buckets,
                )
            })
            .collect();

        let committer = CommitterOperator::new(
            initial_commit_user,
            self.parallelism,
            Box::new(MultiTableCommitter::new(
                self.catalog.clone(),
                self.store_commit,
                self.lock_factory,
            )),
            Box::new(RestoreAndFailCommittableStateManager::new()),
        );

        Ok(CdcMultiplexSink {
            channel_computer: CdcMultiplexChannelComputer::new(
                self.catalog.clone(),
                self.parallelism,
                self.default_num_buckets,
            ),
            writers,
            schema_applier: SchemaChangeApplier::new(self.catalog, self.default_num_buckets),
            committer,
        })
    }
}
