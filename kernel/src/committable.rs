//! Committables: the unit of exchange between writers and the coordinator.
//!
//! A [`Committable`] describes new data produced by one writer instance for one table at one
//! checkpoint. The coordinator folds committables into a per-checkpoint [`ManifestCommittable`]
//! keyed by `(commit user, checkpoint id)`; ownership transfers to the aggregate when a
//! committable is added and the aggregate is freed once its commit succeeds.

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::catalog::Identifier;
use crate::store::NewFilesIncrement;
use crate::{CheckpointId, Error, SinkResult};

/// What a committable carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommittableKind {
    /// New data files produced for one bucket.
    NewFiles(NewFilesIncrement),
    /// A request to compact one bucket, honored by the store at commit time.
    CompactRequest { partition: String, bucket: u32 },
    /// The log-system offset reached for one bucket at this checkpoint.
    LogOffset { bucket: u32, offset: u64 },
}

/// A serializable descriptor of writer output for one table at one checkpoint, awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committable {
    pub table: Identifier,
    pub checkpoint_id: CheckpointId,
    pub kind: CommittableKind,
}

impl Committable {
    pub fn new(table: Identifier, checkpoint_id: CheckpointId, kind: CommittableKind) -> Self {
        Self {
            table,
            checkpoint_id,
            kind,
        }
    }
}

/// The envelope a writer instance emits at each checkpoint snapshot.
///
/// Writers emit a batch even when they produced nothing: the explicit empty contribution is what
/// lets the coordinator decide unambiguously that a checkpoint is commit-ready, and after a
/// restart whether a commit had all its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittableBatch {
    pub writer_index: usize,
    pub checkpoint_id: CheckpointId,
    pub committables: Vec<Committable>,
}

/// Whether a commit appends to the table or replaces partition contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    Append,
    /// Replace the named partition (or the whole table when `None`) with the committed files.
    Overwrite { partition: Option<String> },
}

/// The aggregated commit set for one checkpoint: every committable contributed by every writer
/// instance, keyed by `(commit_user, checkpoint_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestCommittable {
    pub commit_user: String,
    pub checkpoint_id: CheckpointId,
    pub kind: CommitKind,
    committables: Vec<Committable>,
}

impl ManifestCommittable {
    pub fn new(commit_user: impl Into<String>, checkpoint_id: CheckpointId) -> Self {
        Self {
            commit_user: commit_user.into(),
            checkpoint_id,
            kind: CommitKind::Append,
            committables: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: CommitKind) -> Self {
        self.kind = kind;
        self
    }

    /// Append one committable. Aggregation is append-only per checkpoint id; a committable tagged
    /// with a different checkpoint is corrupted state.
    pub fn add(&mut self, committable: Committable) -> SinkResult<()> {
        if committable.checkpoint_id != self.checkpoint_id {
            return Err(Error::state_corrupted(format!(
                "committable for checkpoint {} added to aggregate of checkpoint {}",
                committable.checkpoint_id, self.checkpoint_id
            )));
        }
        self.committables.push(committable);
        Ok(())
    }

    pub fn committables(&self) -> &[Committable] {
        &self.committables
    }

    pub fn is_empty(&self) -> bool {
        self.committables.is_empty()
    }

    /// The distinct tables this aggregate touches, with their committables in arrival order.
    /// Iteration order over tables is deterministic (sorted by identifier).
    pub fn by_table(&self) -> BTreeMap<&Identifier, Vec<&Committable>> {
        self.committables
            .iter()
            .map(|c| (&c.table, c))
            .into_group_map()
            .into_iter()
            .collect()
    }

    /// Restrict this aggregate to a single table, preserving order. Used by the multi-table
    /// committer to commit per table.
    pub fn for_table(&self, table: &Identifier) -> ManifestCommittable {
        ManifestCommittable {
            commit_user: self.commit_user.clone(),
            checkpoint_id: self.checkpoint_id,
            kind: self.kind.clone(),
            committables: self
                .committables
                .iter()
                .filter(|c| &c.table == table)
                .cloned()
                .collect(),
        }
    }
}
