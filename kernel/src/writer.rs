//! The writer side of the sink: per-bucket buffering and checkpoint-time committable production.
//!
//! [`StoreSinkWrite`] owns in-memory buffers for the buckets assigned to one writer instance and
//! flushes them through the storage engine's write path when a checkpoint snapshot is requested.
//! Committing is decoupled and asynchronous from writing: `prepare_commit` only *produces*
//! committables; it never waits for the coordinator.
//!
//! [`WriteOperator`] is the host-driven lifecycle object around it: it recovers the commit user
//! and bucket-ownership state on initialize, rejects records for buckets this instance does not
//! own, and answers checkpoint-snapshot requests synchronously with a [`CommittableBatch`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::catalog::Identifier;
use crate::channel::{BucketKey, ChannelComputer};
use crate::committable::{Committable, CommittableBatch, CommittableKind};
use crate::record::SinkRecord;
use crate::state::{
    self, single_value_or_init, StateBackend, COMMIT_USER_STATE, WRITER_STATE,
};
use crate::store::{FileStoreWrite, NewFilesIncrement};
use crate::utils::require;
use crate::{CheckpointId, Error, SinkResult};

/// Buffers records per bucket and turns them into committables at checkpoint boundaries.
pub struct StoreSinkWrite {
    table: Identifier,
    commit_user: String,
    store: Arc<dyn FileStoreWrite>,
    buffers: BTreeMap<BucketKey, Vec<SinkRecord>>,
    compaction_requests: BTreeSet<BucketKey>,
    log_offsets: BTreeMap<u32, u64>,
}

impl StoreSinkWrite {
    pub fn new(
        table: Identifier,
        commit_user: impl Into<String>,
        store: Arc<dyn FileStoreWrite>,
    ) -> Self {
        Self {
            table,
            commit_user: commit_user.into(),
            store,
            buffers: BTreeMap::new(),
            compaction_requests: BTreeSet::new(),
            log_offsets: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &Identifier {
        &self.table
    }

    pub fn commit_user(&self) -> &str {
        &self.commit_user
    }

    /// Append a record to its bucket's buffer. Never blocks on commit completion.
    pub fn write(&mut self, record: SinkRecord) {
        self.buffers.entry(record.bucket_key()).or_default().push(record);
    }

    /// Ask for the bucket to be compacted at the next commit.
    pub fn request_compaction(&mut self, key: BucketKey) {
        self.compaction_requests.insert(key);
    }

    /// Record the log-system offset reached for a bucket. Hosts without a log system never call
    /// this.
    pub fn mark_log_offset(&mut self, bucket: u32, offset: u64) {
        self.log_offsets.insert(bucket, offset);
    }

    /// Buckets with buffered records.
    pub fn active_buckets(&self) -> Vec<BucketKey> {
        self.buffers.keys().cloned().collect()
    }

    /// Flush all buffers through the store's write path and return the ordered committables
    /// produced since the previous checkpoint, each tagged with `checkpoint_id`.
    ///
    /// With `do_compaction`, every flushed bucket also carries a compaction request. A flush
    /// failure is fatal to this instance: the error propagates so the host fails and restarts
    /// the job; partial buffers are never silently dropped.
    pub fn prepare_commit(
        &mut self,
        do_compaction: bool,
        checkpoint_id: CheckpointId,
    ) -> SinkResult<Vec<Committable>> {
        let mut committables = Vec::new();
        let buffers = std::mem::take(&mut self.buffers);
        for (key, rows) in buffers {
            if rows.is_empty() {
                continue;
            }
            let row_count = rows.len();
            let meta = self
                .store
                .write_bucket(&self.table, &key, &rows)
                .map_err(|e| Error::flush_failed(checkpoint_id, e))?;
            debug!(
                table = %self.table,
                bucket = %key,
                row_count,
                file = %meta.file_name,
                "flushed bucket"
            );
            if do_compaction {
                self.compaction_requests.insert(key.clone());
            }
            committables.push(Committable::new(
                self.table.clone(),
                checkpoint_id,
                CommittableKind::NewFiles(NewFilesIncrement {
                    partition: key.partition,
                    bucket: key.bucket,
                    new_files: vec![meta],
                }),
            ));
        }

        for key in std::mem::take(&mut self.compaction_requests) {
            committables.push(Committable::new(
                self.table.clone(),
                checkpoint_id,
                CommittableKind::CompactRequest {
                    partition: key.partition,
                    bucket: key.bucket,
                },
            ));
        }

        for (bucket, offset) in std::mem::take(&mut self.log_offsets) {
            committables.push(Committable::new(
                self.table.clone(),
                checkpoint_id,
                CommittableKind::LogOffset { bucket, offset },
            ));
        }

        Ok(committables)
    }

    /// Release writer resources. A graceful stop snapshots first, so buffers are normally empty
    /// here; anything left is recoverable from the last checkpoint and is reported, not silently
    /// dropped.
    pub fn close(&mut self) {
        let pending: usize = self.buffers.values().map(Vec::len).sum();
        if pending > 0 {
            warn!(
                table = %self.table,
                pending_records = pending,
                "closing writer with un-flushed buffers; they will be re-ingested from the last checkpoint"
            );
        }
        self.buffers.clear();
        self.compaction_requests.clear();
        self.log_offsets.clear();
    }
}

/// Writer-instance state persisted every checkpoint: the bucket-ownership parameters this
/// instance was running with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterState {
    pub num_channels: usize,
    pub writer_index: usize,
    pub owned_buckets: Vec<BucketKey>,
}

/// The host-driven write operator for one table.
///
/// Lifecycle: `initialize` → `process`* → (`snapshot` per checkpoint)* → `close`. The host
/// runtime drives the transitions; this type only implements the handlers.
pub struct WriteOperator {
    table: Identifier,
    store: Arc<dyn FileStoreWrite>,
    initial_commit_user: String,
    writer_index: usize,
    channel_computer: ChannelComputer,
    do_compaction: bool,
    write: Option<StoreSinkWrite>,
    owned_buckets: BTreeSet<BucketKey>,
}

impl std::fmt::Debug for WriteOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOperator")
            .field("table", &self.table)
            .field("initial_commit_user", &self.initial_commit_user)
            .field("writer_index", &self.writer_index)
            .field("channel_computer", &self.channel_computer)
            .field("do_compaction", &self.do_compaction)
            .field("owned_buckets", &self.owned_buckets)
            .finish_non_exhaustive()
    }
}

impl WriteOperator {
    pub fn new(
        table: Identifier,
        store: Arc<dyn FileStoreWrite>,
        initial_commit_user: impl Into<String>,
        writer_index: usize,
        num_channels: usize,
    ) -> Self {
        Self {
            table,
            store,
            initial_commit_user: initial_commit_user.into(),
            writer_index,
            channel_computer: ChannelComputer::new(num_channels),
            do_compaction: false,
            write: None,
            owned_buckets: BTreeSet::new(),
        }
    }

    /// Also compact every written bucket at each checkpoint.
    pub fn with_compaction(mut self, do_compaction: bool) -> Self {
        self.do_compaction = do_compaction;
        self
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Recover the commit user and bucket-ownership state, then open the writer.
    ///
    /// The job can only ever have one commit user and it must be consistent across restarts:
    /// the recovered value always wins over `initial_commit_user` (which is only valid for new
    /// jobs). Recovered buckets that no longer route to this instance mean the parallelism
    /// changed without state redistribution; that is structural and fails the job.
    pub fn initialize(&mut self, backend: &mut dyn StateBackend) -> SinkResult<()> {
        let initial = self.initial_commit_user.clone();
        let commit_user: String =
            single_value_or_init(backend, COMMIT_USER_STATE, move || initial)?;
        info!(table = %self.table, commit_user, writer_index = self.writer_index, "writer initialized");

        if let Some(recovered) = state::get_value::<WriterState>(backend, WRITER_STATE)? {
            for key in &recovered.owned_buckets {
                require!(
                    self.channel_computer.owns(self.writer_index, key),
                    Error::bucket_ownership(format!(
                        "recovered bucket {key} of table {} is not owned by writer {} at parallelism {}",
                        self.table,
                        self.writer_index,
                        self.channel_computer.num_channels()
                    ))
                );
            }
            self.owned_buckets = recovered.owned_buckets.into_iter().collect();
        }

        self.write = Some(StoreSinkWrite::new(
            self.table.clone(),
            commit_user,
            self.store.clone(),
        ));
        Ok(())
    }

    /// Ingest one record. The record must belong to a bucket this instance owns; the routing
    /// side uses the same channel computation, so a mismatch means mis-routed input.
    pub fn process(&mut self, record: SinkRecord) -> SinkResult<()> {
        let key = record.bucket_key();
        require!(
            self.channel_computer.owns(self.writer_index, &key),
            Error::bucket_ownership(format!(
                "record for bucket {key} routed to writer {} which owns channel {}",
                self.writer_index,
                self.channel_computer.channel(&key)
            ))
        );
        self.owned_buckets.insert(key);
        self.write_mut()?.write(record);
        Ok(())
    }

    /// Record the log-system offset reached for a bucket; emitted as a committable at the next
    /// checkpoint.
    pub fn mark_log_offset(&mut self, bucket: u32, offset: u64) -> SinkResult<()> {
        self.write_mut()?.mark_log_offset(bucket, offset);
        Ok(())
    }

    /// Respond to a checkpoint-snapshot request: flush, persist writer state, and return this
    /// instance's contribution, emitted even when empty so the coordinator can tell when the
    /// checkpoint is commit-ready.
    #[instrument(name = "writer.snapshot", skip_all, fields(checkpoint_id, writer_index = self.writer_index), err)]
    pub fn snapshot(
        &mut self,
        backend: &mut dyn StateBackend,
        checkpoint_id: CheckpointId,
    ) -> SinkResult<CommittableBatch> {
        let do_compaction = self.do_compaction;
        let committables = self
            .write_mut()?
            .prepare_commit(do_compaction, checkpoint_id)?;
        let writer_state = WriterState {
            num_channels: self.channel_computer.num_channels(),
            writer_index: self.writer_index,
            owned_buckets: self.owned_buckets.iter().cloned().collect(),
        };
        state::put_value(backend, WRITER_STATE, &writer_state)?;
        Ok(CommittableBatch {
            writer_index: self.writer_index,
            checkpoint_id,
            committables,
        })
    }

    pub fn close(&mut self) {
        if let Some(write) = self.write.as_mut() {
            write.close();
        }
        self.write = None;
    }

    fn write_mut(&mut self) -> SinkResult<&mut StoreSinkWrite> {
        self.write
            .as_mut()
            .ok_or_else(|| Error::generic("write operator used before initialize"))
    }
}
