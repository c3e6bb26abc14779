//! The global coordinator operator.
//!
//! A single logical instance (parallelism 1) that collects [`CommittableBatch`]es from all
//! writer instances, folds them into per-checkpoint [`ManifestCommittable`]s, persists the
//! pending aggregate at every snapshot, and commits checkpoints in order once the host signals
//! checkpoint completion. Within a process this operator is the sole mutator of the pending
//! aggregate.
//!
//! Barrier contract assumed from the host runtime: all writer contributions for checkpoint N
//! arrive before the coordinator's own snapshot-N request, and input channels are FIFO, so any
//! pending aggregate persisted at snapshot N is complete. A checkpoint that reaches commit time
//! with a missing contribution therefore indicates a broken barrier or corrupted state, and the
//! job fails.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, instrument, warn};

use crate::committable::{CommitKind, CommittableBatch, ManifestCommittable};
use crate::committer::{CommittableStateManager, Committer};
use crate::state::{single_value_or_init, StateBackend, COMMIT_USER_STATE};
use crate::utils::require;
use crate::{CheckpointId, Error, SinkResult};

struct PendingCheckpoint {
    manifest: ManifestCommittable,
    contributions: BTreeSet<usize>,
}

/// The parallelism-1 coordinator. The host runtime drives the lifecycle:
/// `initialize` → (`process`* → `snapshot` → `notify_checkpoint_completed`)* → `close`.
pub struct CommitterOperator {
    initial_commit_user: String,
    expected_writers: usize,
    commit_kind: CommitKind,
    committer: Box<dyn Committer>,
    state_manager: Box<dyn CommittableStateManager>,
    commit_user: Option<String>,
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
}

impl std::fmt::Debug for CommitterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitterOperator")
            .field("initial_commit_user", &self.initial_commit_user)
            .field("expected_writers", &self.expected_writers)
            .field("commit_kind", &self.commit_kind)
            .field("commit_user", &self.commit_user)
            .finish_non_exhaustive()
    }
}

impl CommitterOperator {
    pub fn new(
        initial_commit_user: impl Into<String>,
        expected_writers: usize,
        committer: Box<dyn Committer>,
        state_manager: Box<dyn CommittableStateManager>,
    ) -> Self {
        Self {
            initial_commit_user: initial_commit_user.into(),
            expected_writers,
            commit_kind: CommitKind::Append,
            committer,
            state_manager,
            commit_user: None,
            pending: BTreeMap::new(),
        }
    }

    /// Commit with overwrite semantics (replacing the named partition, or the whole table).
    pub fn with_commit_kind(mut self, commit_kind: CommitKind) -> Self {
        self.commit_kind = commit_kind;
        self
    }

    /// Recover the commit user and finish any interrupted commits before accepting input.
    pub fn initialize(&mut self, backend: &mut dyn StateBackend) -> SinkResult<()> {
        let initial = self.initial_commit_user.clone();
        let commit_user: String =
            single_value_or_init(backend, COMMIT_USER_STATE, move || initial)?;
        info!(commit_user, "committer operator initialized");
        self.commit_user = Some(commit_user);
        self.state_manager
            .initialize(backend, self.committer.as_mut())
    }

    /// Fold one writer contribution into its checkpoint's aggregate.
    pub fn process(&mut self, batch: CommittableBatch) -> SinkResult<()> {
        let commit_user = self.commit_user()?.to_string();
        require!(
            batch.writer_index < self.expected_writers,
            Error::state_corrupted(format!(
                "contribution from writer {} but only {} writers are active",
                batch.writer_index, self.expected_writers
            ))
        );

        let commit_kind = self.commit_kind.clone();
        let entry = self
            .pending
            .entry(batch.checkpoint_id)
            .or_insert_with(|| PendingCheckpoint {
                manifest: ManifestCommittable::new(commit_user, batch.checkpoint_id)
                    .with_kind(commit_kind),
                contributions: BTreeSet::new(),
            });
        require!(
            entry.contributions.insert(batch.writer_index),
            Error::state_corrupted(format!(
                "duplicate contribution from writer {} for checkpoint {}",
                batch.writer_index, batch.checkpoint_id
            ))
        );
        for committable in batch.committables {
            entry.manifest.add(committable)?;
        }
        Ok(())
    }

    /// Persist the pending aggregate. Called synchronously when the checkpoint barrier reaches
    /// this operator; by the barrier contract every aggregate present here is complete.
    pub fn snapshot(
        &mut self,
        backend: &mut dyn StateBackend,
        checkpoint_id: CheckpointId,
    ) -> SinkResult<()> {
        if let Some(latest) = self.pending.keys().next_back() {
            require!(
                *latest <= checkpoint_id,
                Error::state_corrupted(format!(
                    "snapshot for checkpoint {checkpoint_id} but contributions for {latest} already arrived"
                ))
            );
        }
        let manifests: Vec<&ManifestCommittable> =
            self.pending.values().map(|p| &p.manifest).collect();
        self.state_manager.snapshot(backend, manifests)
    }

    /// Commit every pending checkpoint up to and including `checkpoint_id`, in order. Aggregates
    /// are freed once their commit succeeds.
    #[instrument(name = "committer.notify", skip_all, fields(checkpoint_id), err)]
    pub fn notify_checkpoint_completed(&mut self, checkpoint_id: CheckpointId) -> SinkResult<()> {
        let ready: Vec<CheckpointId> = self
            .pending
            .range(..=checkpoint_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            let entry = self.pending.remove(&id).expect("range yielded key");
            require!(
                entry.contributions.len() == self.expected_writers,
                Error::state_corrupted(format!(
                    "checkpoint {id} is not commit-ready: {} of {} writer contributions received",
                    entry.contributions.len(),
                    self.expected_writers
                ))
            );
            info!(
                checkpoint_id = id,
                committables = entry.manifest.committables().len(),
                "checkpoint commit-ready"
            );
            self.committer.commit(entry.manifest)?;
        }
        Ok(())
    }

    /// Uncommitted aggregates are recoverable from the persisted state; they are reported, not
    /// silently dropped.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            let checkpoints: Vec<CheckpointId> = self.pending.keys().copied().collect();
            warn!(
                ?checkpoints,
                "closing coordinator with pending uncommitted checkpoints; they will be recovered from state"
            );
        }
        self.pending.clear();
    }

    fn commit_user(&self) -> SinkResult<&str> {
        self.commit_user
            .as_deref()
            .ok_or_else(|| Error::generic("committer operator used before initialize"))
    }
}
