//! The commit side of the sink.
//!
//! A [`Committer`] turns an aggregated [`ManifestCommittable`] into an atomic, idempotent table
//! commit. [`TableCommitter`] commits one table through the store's commit path, optionally under
//! a catalog lock, retrying transient conflicts with the identical input. For the multiplexed
//! case, [`MultiTableCommitter`] creates per-table committers lazily, keyed by [`Identifier`],
//! the first time a committable referencing that table arrives, so the job topology never changes
//! when tables are added.
//!
//! All commit decisions happen in the single-instance [`CommitterOperator`]
//! (parallelism 1), which serializes commits to the same table; no concurrent commits to one
//! table are possible from within a job.

pub mod operator;
pub mod state;

pub use operator::CommitterOperator;
pub use state::{
    CommittableStateManager, NoopCommittableStateManager, RestoreAndFailCommittableStateManager,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::catalog::{run_with_lock, Catalog, Identifier, LockFactory};
use crate::committable::ManifestCommittable;
use crate::store::{CommitStatus, FileStoreCommit};
use crate::utils::require;
use crate::{Error, SinkResult};

/// Default number of additional attempts for a transiently failed commit.
pub const DEFAULT_COMMIT_RETRIES: usize = 2;

/// Commits aggregated committables to the table(s).
pub trait Committer: Send {
    /// Resolve recovered aggregates against the table's durable commit records and return only
    /// those that still need committing. This is what distinguishes "commit attempted, outcome
    /// unknown" from "not yet attempted" after a restart.
    fn filter_recovered(
        &mut self,
        recovered: Vec<ManifestCommittable>,
    ) -> SinkResult<Vec<ManifestCommittable>>;

    /// Atomically commit one aggregate. Idempotent under re-invocation with the same
    /// (commit user, checkpoint id, content).
    fn commit(&mut self, committable: ManifestCommittable) -> SinkResult<()>;
}

/// Commits one table's aggregates through the store's commit path.
pub struct TableCommitter {
    table: Identifier,
    store: Arc<dyn FileStoreCommit>,
    lock_factory: Arc<dyn LockFactory>,
    commit_empty: bool,
    commit_retries: usize,
}

impl TableCommitter {
    pub fn new(
        table: Identifier,
        store: Arc<dyn FileStoreCommit>,
        lock_factory: Arc<dyn LockFactory>,
    ) -> Self {
        Self {
            table,
            store,
            lock_factory,
            commit_empty: false,
            commit_retries: DEFAULT_COMMIT_RETRIES,
        }
    }

    /// Commit even an empty file list. Required when streaming checkpoints are enabled:
    /// without the empty commit a restart cannot tell whether the checkpoint was committed.
    pub fn with_commit_empty(mut self, commit_empty: bool) -> Self {
        self.commit_empty = commit_empty;
        self
    }

    pub fn with_commit_retries(mut self, commit_retries: usize) -> Self {
        self.commit_retries = commit_retries;
        self
    }

    pub fn table(&self) -> &Identifier {
        &self.table
    }
}

impl Committer for TableCommitter {
    fn filter_recovered(
        &mut self,
        recovered: Vec<ManifestCommittable>,
    ) -> SinkResult<Vec<ManifestCommittable>> {
        let mut pending = Vec::new();
        for committable in recovered {
            let uncommitted = self.store.filter_committed(
                &self.table,
                &committable.commit_user,
                &[committable.checkpoint_id],
            )?;
            if uncommitted.is_empty() {
                info!(
                    table = %self.table,
                    checkpoint_id = committable.checkpoint_id,
                    "recovered committable was already committed; dropping"
                );
            } else {
                pending.push(committable);
            }
        }
        Ok(pending)
    }

    #[instrument(
        name = "committer.commit",
        skip_all,
        fields(table = %self.table, checkpoint_id = committable.checkpoint_id),
        err
    )]
    fn commit(&mut self, committable: ManifestCommittable) -> SinkResult<()> {
        for c in committable.committables() {
            require!(
                c.table == self.table,
                Error::state_corrupted(format!(
                    "committable for table {} reached committer of table {}",
                    c.table, self.table
                ))
            );
        }
        if committable.is_empty() && !self.commit_empty {
            debug!("nothing to commit");
            return Ok(());
        }

        let lock = self.lock_factory.create_lock();
        let mut attempt = 0;
        loop {
            let result = run_with_lock(lock.as_deref(), || {
                self.store.commit(&self.table, &committable)
            });
            match result {
                Ok(CommitStatus::Committed { snapshot }) => {
                    info!(snapshot, "committed");
                    return Ok(());
                }
                Ok(CommitStatus::Skipped { snapshot }) => {
                    info!(snapshot, "checkpoint already committed; skipped");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.commit_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient commit failure; retrying with identical input");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Commits to many tables through lazily created per-table committers.
///
/// A committer for a table is created the first time an aggregate references it; the catalog is
/// consulted to make sure the table exists. Within one aggregate, tables are committed in
/// deterministic identifier order, and each table's commit is atomic on its own: the per-table
/// commit records keep a retried aggregate idempotent even when a failure lands between tables.
pub struct MultiTableCommitter {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn FileStoreCommit>,
    lock_factory: Arc<dyn LockFactory>,
    committers: BTreeMap<Identifier, TableCommitter>,
}

impl MultiTableCommitter {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn FileStoreCommit>,
        lock_factory: Arc<dyn LockFactory>,
    ) -> Self {
        Self {
            catalog,
            store,
            lock_factory,
            committers: BTreeMap::new(),
        }
    }

    /// The tables for which a committer has been created so far.
    pub fn tables(&self) -> Vec<Identifier> {
        self.committers.keys().cloned().collect()
    }

    fn committer_for(&mut self, table: &Identifier) -> SinkResult<&mut TableCommitter> {
        if !self.committers.contains_key(table) {
            // Surfaces TableNotFound if the table was never created.
            self.catalog.table_schema(table)?;
            info!(table = %table, "created committer for newly seen table");
            self.committers.insert(
                table.clone(),
                TableCommitter::new(table.clone(), self.store.clone(), self.lock_factory.clone()),
            );
        }
        Ok(self.committers.get_mut(table).expect("just inserted"))
    }
}

impl Committer for MultiTableCommitter {
    fn filter_recovered(
        &mut self,
        recovered: Vec<ManifestCommittable>,
    ) -> SinkResult<Vec<ManifestCommittable>> {
        let mut pending = Vec::new();
        for committable in recovered {
            let mut still_pending = ManifestCommittable::new(
                committable.commit_user.clone(),
                committable.checkpoint_id,
            )
            .with_kind(committable.kind.clone());
            for (table, group) in committable.by_table() {
                let uncommitted = self.store.filter_committed(
                    table,
                    &committable.commit_user,
                    &[committable.checkpoint_id],
                )?;
                if uncommitted.is_empty() {
                    info!(
                        table = %table,
                        checkpoint_id = committable.checkpoint_id,
                        "recovered table aggregate was already committed; dropping"
                    );
                    continue;
                }
                for c in group {
                    still_pending.add(c.clone())?;
                }
            }
            if !still_pending.is_empty() {
                pending.push(still_pending);
            }
        }
        Ok(pending)
    }

    fn commit(&mut self, committable: ManifestCommittable) -> SinkResult<()> {
        let tables: Vec<Identifier> = committable.by_table().keys().map(|t| (*t).clone()).collect();
        for table in tables {
            let scoped = committable.for_table(&table);
            self.committer_for(&table)?.commit(scoped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committable::{Committable, CommittableKind};
    use crate::engine::memory::{MemoryCatalog, MemoryFileStore, MemoryLockFactory};
    use crate::schema::{DataField, DataTypeKind, TableSchema};
    use crate::store::{DataFileMeta, NewFilesIncrement};

    fn table(name: &str) -> Identifier {
        Identifier::new("db", name)
    }

    fn manifest(user: &str, checkpoint_id: u64, tables: &[(&str, &str)]) -> ManifestCommittable {
        let mut manifest = ManifestCommittable::new(user, checkpoint_id);
        for (name, file) in tables {
            manifest
                .add(Committable::new(
                    table(name),
                    checkpoint_id,
                    CommittableKind::NewFiles(NewFilesIncrement {
                        partition: "p".to_string(),
                        bucket: 0,
                        new_files: vec![DataFileMeta {
                            file_name: file.to_string(),
                            row_count: 1,
                            file_size: 1,
                        }],
                    }),
                ))
                .unwrap();
        }
        manifest
    }

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![DataField::new("id", DataTypeKind::Int)],
            vec![],
            vec!["id".to_string()],
            2,
        )
    }

    #[test]
    fn commit_is_idempotent() {
        let store = MemoryFileStore::shared();
        let mut committer =
            TableCommitter::new(table("t"), store.clone(), MemoryLockFactory::shared());
        committer.commit(manifest("user", 5, &[("t", "f1")])).unwrap();
        committer.commit(manifest("user", 5, &[("t", "f1")])).unwrap();
        assert_eq!(store.snapshots(&table("t")).len(), 1);
        assert_eq!(store.visible_files(&table("t")).len(), 1);
    }

    #[test]
    fn transient_conflict_retried_with_identical_input() {
        let store = MemoryFileStore::shared();
        store.fail_next_commits(2, "lock lost");
        let mut committer =
            TableCommitter::new(table("t"), store.clone(), MemoryLockFactory::shared());
        committer.commit(manifest("user", 1, &[("t", "f1")])).unwrap();
        assert_eq!(store.snapshots(&table("t")).len(), 1);
    }

    #[test]
    fn retries_are_bounded() {
        let store = MemoryFileStore::shared();
        store.fail_next_commits(10, "lock lost");
        let mut committer = TableCommitter::new(table("t"), store, MemoryLockFactory::shared())
            .with_commit_retries(1);
        let err = committer.commit(manifest("user", 1, &[("t", "f1")])).unwrap_err();
        assert!(matches!(err, Error::CommitConflict(_)));
    }

    #[test]
    fn empty_commit_only_when_checkpointing() {
        let store = MemoryFileStore::shared();
        let empty = ManifestCommittable::new("user", 3);

        let mut without =
            TableCommitter::new(table("t"), store.clone(), MemoryLockFactory::shared());
        without.commit(empty.clone()).unwrap();
        assert!(store.snapshots(&table("t")).is_empty());

        let mut with = TableCommitter::new(table("t"), store.clone(), MemoryLockFactory::shared())
            .with_commit_empty(true);
        with.commit(empty).unwrap();
        // The empty snapshot is what makes the commit detectable after a restart.
        assert_eq!(store.snapshots(&table("t")).len(), 1);
        assert_eq!(
            store.filter_committed(&table("t"), "user", &[3]).unwrap(),
            Vec::<u64>::new()
        );
    }

    #[test]
    fn foreign_table_committable_is_corrupted_state() {
        let store = MemoryFileStore::shared();
        let mut committer = TableCommitter::new(table("t"), store, MemoryLockFactory::shared());
        let err = committer
            .commit(manifest("user", 1, &[("other", "f1")]))
            .unwrap_err();
        assert!(matches!(err, Error::StateCorrupted(_)));
    }

    #[test]
    fn multi_table_committers_created_lazily() {
        let store = MemoryFileStore::shared();
        let catalog = MemoryCatalog::shared();
        catalog.create_table(&table("a"), schema(), false).unwrap();
        catalog.create_table(&table("b"), schema(), false).unwrap();

        let mut committer =
            MultiTableCommitter::new(catalog, store.clone(), MemoryLockFactory::shared());
        assert!(committer.tables().is_empty());

        committer
            .commit(manifest("user", 1, &[("a", "f1"), ("b", "f2"), ("a", "f3")]))
            .unwrap();
        assert_eq!(committer.tables(), vec![table("a"), table("b")]);
        assert_eq!(store.visible_files(&table("a")).len(), 2);
        assert_eq!(store.visible_files(&table("b")).len(), 1);
    }

    #[test]
    fn multi_table_commit_requires_existing_table() {
        let store = MemoryFileStore::shared();
        let catalog = MemoryCatalog::shared();
        let mut committer = MultiTableCommitter::new(catalog, store, MemoryLockFactory::shared());
        let err = committer
            .commit(manifest("user", 1, &[("ghost", "f1")]))
            .unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }

    #[test]
    fn multi_table_filter_recovered_drops_committed_groups() {
        let store = MemoryFileStore::shared();
        let catalog = MemoryCatalog::shared();
        catalog.create_table(&table("a"), schema(), false).unwrap();
        catalog.create_table(&table("b"), schema(), false).unwrap();

        // Table a's part of checkpoint 7 already landed; table b's did not.
        let mut committer =
            MultiTableCommitter::new(catalog, store.clone(), MemoryLockFactory::shared());
        committer.commit(manifest("user", 7, &[("a", "f1")])).unwrap();

        let recovered = manifest("user", 7, &[("a", "f1"), ("b", "f2")]);
        let pending = committer.filter_recovered(vec![recovered]).unwrap();
        assert_eq!(pending.len(), 1);
        let tables: Vec<_> = pending[0]
            .by_table()
            .keys()
            .map(|t| t.table.clone())
            .collect();
        assert_eq!(tables, vec!["b".to_string()]);
    }
}
