//! The storage-engine collaborator contracts.
//!
//! The kernel consumes two seams of the file store: the write path ([`FileStoreWrite`]), which
//! turns flushed row buffers into immutable data files, and the commit path ([`FileStoreCommit`]),
//! which atomically registers a set of file descriptors as a new table snapshot. The on-disk
//! format, the LSM levels, and the compaction algorithm all live behind these traits.
//!
//! The commit path is required to be idempotent by `(commit user, checkpoint id)`: re-committing
//! the same pair must not duplicate data, and [`FileStoreCommit::filter_committed`] lets the
//! coordinator resolve an unknown commit outcome after a restart.

use serde::{Deserialize, Serialize};

use crate::catalog::Identifier;
use crate::channel::BucketKey;
use crate::committable::ManifestCommittable;
use crate::record::SinkRecord;
use crate::{CheckpointId, SinkResult, SnapshotId};

/// Metadata of one immutable data file produced by the write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub file_name: String,
    pub row_count: u64,
    pub file_size: u64,
}

/// New files produced for one bucket since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFilesIncrement {
    pub partition: String,
    pub bucket: u32,
    pub new_files: Vec<DataFileMeta>,
}

impl NewFilesIncrement {
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(self.partition.clone(), self.bucket)
    }
}

/// Outcome of an atomic commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The commit was applied and produced this snapshot.
    Committed { snapshot: SnapshotId },
    /// The same (commit user, checkpoint id) was already committed earlier; nothing was applied.
    Skipped { snapshot: SnapshotId },
}

impl CommitStatus {
    pub fn snapshot(&self) -> SnapshotId {
        match self {
            CommitStatus::Committed { snapshot } | CommitStatus::Skipped { snapshot } => *snapshot,
        }
    }
}

/// The write path of the storage engine.
///
/// Implementations take ownership of durability for the produced file only once
/// [`FileStoreCommit::commit`] registers it; an un-committed file must never become visible to
/// readers.
pub trait FileStoreWrite: Send + Sync {
    /// Convert the buffered rows of one bucket into an immutable data file and return its
    /// descriptor. Called by writers at checkpoint-flush time; never on the ingestion hot path.
    fn write_bucket(
        &self,
        table: &Identifier,
        key: &BucketKey,
        rows: &[SinkRecord],
    ) -> SinkResult<DataFileMeta>;
}

/// The commit path of the storage engine.
pub trait FileStoreCommit: Send + Sync {
    /// Atomically register `committable`'s file descriptors for `table` as a new snapshot:
    /// either every referenced file becomes visible, or none does.
    ///
    /// Must be idempotent by `(commit_user, checkpoint_id)`: a retry with the same pair returns
    /// [`CommitStatus::Skipped`] instead of duplicating data. Transient races with a concurrent
    /// committer surface as [`Error::CommitConflict`](crate::Error) and may be retried with the
    /// identical committable.
    fn commit(&self, table: &Identifier, committable: &ManifestCommittable)
        -> SinkResult<CommitStatus>;

    /// Of the given checkpoint ids, return those `commit_user` has NOT yet committed to `table`,
    /// in ascending order. Used after a restart to tell "commit attempted, outcome unknown" from
    /// "not yet attempted".
    fn filter_committed(
        &self,
        table: &Identifier,
        commit_user: &str,
        checkpoint_ids: &[CheckpointId],
    ) -> SinkResult<Vec<CheckpointId>>;
}
