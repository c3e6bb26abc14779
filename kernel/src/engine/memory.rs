//! In-memory engine: a single-process implementation of the store and catalog collaborators.
//!
//! Snapshots, commit records, and file visibility follow the contracts in
//! [`store`](crate::store): files written through the write path stay staged and invisible until
//! a commit references them, a commit applies atomically under one lock, and commit records keyed
//! by `(commit user, checkpoint id)` make re-commits skip instead of duplicating data.
//!
//! Tests use the failure toggles ([`MemoryFileStore::fail_next_commits`],
//! [`MemoryFileStore::set_unreachable`], [`MemoryFileStore::fail_next_write`]) to exercise the
//! retry and recovery paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use url::Url;

use crate::catalog::{Catalog, CatalogLock, Identifier, LockFactory};
use crate::channel::BucketKey;
use crate::committable::{CommitKind, CommittableKind, ManifestCommittable};
use crate::record::SinkRecord;
use crate::schema::{SchemaChange, TableSchema};
use crate::store::{CommitStatus, DataFileMeta, FileStoreCommit, FileStoreWrite};
use crate::{CheckpointId, Error, SinkResult, SnapshotId};

/// A committed table snapshot, durable for the life of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub id: SnapshotId,
    pub commit_user: String,
    pub checkpoint_id: CheckpointId,
    pub kind: CommitKind,
    pub added_files: Vec<String>,
}

#[derive(Debug, Clone)]
struct StagedFile {
    partition: String,
    bucket: u32,
    rows: Vec<SinkRecord>,
}

#[derive(Debug, Clone)]
struct VisibleFile {
    name: String,
    partition: String,
}

#[derive(Debug, Default)]
struct TableState {
    staged: BTreeMap<String, StagedFile>,
    visible: Vec<VisibleFile>,
    snapshots: Vec<MemorySnapshot>,
    commit_records: BTreeMap<(String, CheckpointId), SnapshotId>,
    compactions: Vec<(String, u32)>,
    log_offsets: BTreeMap<u32, u64>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: BTreeMap<Identifier, TableState>,
    next_file: u64,
    fail_next_write: Option<String>,
    fail_next_commits: usize,
    fail_commit_message: String,
    unreachable: bool,
}

/// In-memory file store implementing both the write and the commit path. Files it produces are
/// addressed under a store-root URL, like any object-store-backed engine would.
#[derive(Debug)]
pub struct MemoryFileStore {
    root: Url,
    inner: Mutex<StoreState>,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::with_root(Url::parse("memory:///").expect("static url is valid"))
    }
}

impl MemoryFileStore {
    pub fn with_root(root: Url) -> Self {
        Self {
            root,
            inner: Mutex::default(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Make the next `write_bucket` call fail.
    pub fn fail_next_write(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().fail_next_write = Some(message.into());
    }

    /// Make the next `count` commit calls fail with a transient conflict.
    pub fn fail_next_commits(&self, count: usize, message: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_commits = count;
        inner.fail_commit_message = message.into();
    }

    /// Simulate an unreachable commit target.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap().unreachable = unreachable;
    }

    /// Committed snapshots of a table, oldest first.
    pub fn snapshots(&self, table: &Identifier) -> Vec<MemorySnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(table)
            .map(|t| t.snapshots.clone())
            .unwrap_or_default()
    }

    /// Names of files currently visible to readers of a table.
    pub fn visible_files(&self, table: &Identifier) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(table)
            .map(|t| t.visible.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Rows of all visible files of a partition, in commit order. Files the store never staged
    /// (committed by descriptor only) contribute no rows.
    pub fn partition_rows(&self, table: &Identifier, partition: &str) -> Vec<SinkRecord> {
        let inner = self.inner.lock().unwrap();
        let Some(state) = inner.tables.get(table) else {
            return Vec::new();
        };
        state
            .visible
            .iter()
            .filter(|f| f.partition == partition)
            .filter_map(|f| state.staged.get(&f.name))
            .flat_map(|staged| staged.rows.iter().cloned())
            .collect()
    }

    /// Compaction requests honored so far, in commit order.
    pub fn compactions(&self, table: &Identifier) -> Vec<(String, u32)> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(table)
            .map(|t| t.compactions.clone())
            .unwrap_or_default()
    }

    /// Latest committed log offsets per bucket.
    pub fn log_offsets(&self, table: &Identifier) -> BTreeMap<u32, u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(table)
            .map(|t| t.log_offsets.clone())
            .unwrap_or_default()
    }
}

impl FileStoreWrite for MemoryFileStore {
    fn write_bucket(
        &self,
        table: &Identifier,
        key: &BucketKey,
        rows: &[SinkRecord],
    ) -> SinkResult<DataFileMeta> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.fail_next_write.take() {
            return Err(Error::generic(message));
        }
        inner.next_file += 1;
        let file_name = self
            .root
            .join(&format!("data-{:08}", inner.next_file))
            .map_err(|e| Error::generic(e))?
            .to_string();
        let meta = DataFileMeta {
            file_name: file_name.clone(),
            row_count: rows.len() as u64,
            file_size: rows.len() as u64 * 64,
        };
        inner.tables.entry(table.clone()).or_default().staged.insert(
            file_name,
            StagedFile {
                partition: key.partition.clone(),
                bucket: key.bucket,
                rows: rows.to_vec(),
            },
        );
        Ok(meta)
    }
}

impl FileStoreCommit for MemoryFileStore {
    fn commit(
        &self,
        table: &Identifier,
        committable: &ManifestCommittable,
    ) -> SinkResult<CommitStatus> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unreachable {
            return Err(Error::catalog_unavailable("commit target unreachable"));
        }
        if inner.fail_next_commits > 0 {
            inner.fail_next_commits -= 1;
            let message = inner.fail_commit_message.clone();
            return Err(Error::commit_conflict(message));
        }

        let state = inner.tables.entry(table.clone()).or_default();
        let record_key = (
            committable.commit_user.clone(),
            committable.checkpoint_id,
        );
        if let Some(snapshot) = state.commit_records.get(&record_key) {
            return Ok(CommitStatus::Skipped {
                snapshot: *snapshot,
            });
        }

        // The whole mutation below happens under the store lock: either every referenced file
        // becomes visible, or (had we failed above) none of them.
        if let CommitKind::Overwrite { partition } = &committable.kind {
            match partition {
                Some(partition) => state.visible.retain(|f| &f.partition != partition),
                None => state.visible.clear(),
            }
        }

        let mut added_files = Vec::new();
        for item in committable.committables() {
            match &item.kind {
                CommittableKind::NewFiles(increment) => {
                    for file in &increment.new_files {
                        state.visible.push(VisibleFile {
                            name: file.file_name.clone(),
                            partition: increment.partition.clone(),
                        });
                        added_files.push(file.file_name.clone());
                    }
                }
                CommittableKind::CompactRequest { partition, bucket } => {
                    state.compactions.push((partition.clone(), *bucket));
                }
                CommittableKind::LogOffset { bucket, offset } => {
                    state.log_offsets.insert(*bucket, *offset);
                }
            }
        }

        let snapshot = state.snapshots.len() as SnapshotId + 1;
        state.snapshots.push(MemorySnapshot {
            id: snapshot,
            commit_user: committable.commit_user.clone(),
            checkpoint_id: committable.checkpoint_id,
            kind: committable.kind.clone(),
            added_files,
        });
        state.commit_records.insert(record_key, snapshot);
        Ok(CommitStatus::Committed { snapshot })
    }

    fn filter_committed(
        &self,
        table: &Identifier,
        commit_user: &str,
        checkpoint_ids: &[CheckpointId],
    ) -> SinkResult<Vec<CheckpointId>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<CheckpointId> = match inner.tables.get(table) {
            None => checkpoint_ids.to_vec(),
            Some(state) => checkpoint_ids
                .iter()
                .copied()
                .filter(|id| {
                    !state
                        .commit_records
                        .contains_key(&(commit_user.to_string(), *id))
                })
                .collect(),
        };
        pending.sort_unstable();
        Ok(pending)
    }
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: Mutex<BTreeMap<Identifier, TableSchema>>,
}

impl MemoryCatalog {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Catalog for MemoryCatalog {
    fn table_schema(&self, identifier: &Identifier) -> SinkResult<TableSchema> {
        self.tables
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::table_not_found(identifier))
    }

    fn create_table(
        &self,
        identifier: &Identifier,
        schema: TableSchema,
        ignore_if_exists: bool,
    ) -> SinkResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(identifier) {
            if ignore_if_exists {
                return Ok(());
            }
            return Err(Error::generic(format!("table {identifier} already exists")));
        }
        tables.insert(identifier.clone(), schema);
        Ok(())
    }

    fn apply_schema_change(
        &self,
        identifier: &Identifier,
        changes: &[SchemaChange],
    ) -> SinkResult<TableSchema> {
        let mut tables = self.tables.lock().unwrap();
        let schema = tables
            .get_mut(identifier)
            .ok_or_else(|| Error::table_not_found(identifier))?;
        schema.apply(changes);
        Ok(schema.clone())
    }
}

/// Advisory lock shared by every lock the factory creates; acquiring a held lock is reported as
/// transient contention.
#[derive(Debug, Default)]
pub struct MemoryLockFactory {
    held: Arc<Mutex<bool>>,
}

impl MemoryLockFactory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl LockFactory for MemoryLockFactory {
    fn create_lock(&self) -> Option<Box<dyn CatalogLock>> {
        Some(Box::new(MemoryLock {
            held: self.held.clone(),
        }))
    }
}

struct MemoryLock {
    held: Arc<Mutex<bool>>,
}

impl CatalogLock for MemoryLock {
    fn acquire(&self) -> SinkResult<()> {
        let mut held = self.held.lock().unwrap();
        if *held {
            return Err(Error::commit_conflict("catalog lock contention"));
        }
        *held = true;
        Ok(())
    }

    fn release(&self) -> SinkResult<()> {
        *self.held.lock().unwrap() = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committable::Committable;
    use crate::record::RowKind;
    use crate::store::NewFilesIncrement;

    fn table() -> Identifier {
        Identifier::new("db", "t")
    }

    fn record(id: &str) -> SinkRecord {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), id.to_string());
        SinkRecord::new(RowKind::Insert, "p", 0, fields)
    }

    fn manifest_for(meta: DataFileMeta, partition: &str, checkpoint_id: u64) -> ManifestCommittable {
        let mut manifest = ManifestCommittable::new("user", checkpoint_id);
        manifest
            .add(Committable::new(
                table(),
                checkpoint_id,
                CommittableKind::NewFiles(NewFilesIncrement {
                    partition: partition.to_string(),
                    bucket: 0,
                    new_files: vec![meta],
                }),
            ))
            .unwrap();
        manifest
    }

    #[test]
    fn staged_files_invisible_until_commit() {
        let store = MemoryFileStore::shared();
        let key = BucketKey::new("p", 0);
        let meta = store
            .write_bucket(&table(), &key, &[record("1"), record("2")])
            .unwrap();
        assert_eq!(meta.row_count, 2);
        assert!(store.visible_files(&table()).is_empty());
        assert!(store.partition_rows(&table(), "p").is_empty());

        store.commit(&table(), &manifest_for(meta, "p", 1)).unwrap();
        assert_eq!(store.visible_files(&table()).len(), 1);
        assert_eq!(store.partition_rows(&table(), "p").len(), 2);
    }

    #[test]
    fn recommit_same_user_and_checkpoint_skips() {
        let store = MemoryFileStore::shared();
        let meta = store
            .write_bucket(&table(), &BucketKey::new("p", 0), &[record("1")])
            .unwrap();
        let manifest = manifest_for(meta, "p", 5);
        let first = store.commit(&table(), &manifest).unwrap();
        let second = store.commit(&table(), &manifest).unwrap();
        assert!(matches!(first, CommitStatus::Committed { snapshot: 1 }));
        assert!(matches!(second, CommitStatus::Skipped { snapshot: 1 }));
        assert_eq!(store.partition_rows(&table(), "p").len(), 1);
        assert_eq!(
            store.filter_committed(&table(), "user", &[4, 5, 6]).unwrap(),
            vec![4, 6]
        );
    }

    #[test]
    fn overwrite_replaces_partition_contents() {
        let store = MemoryFileStore::shared();
        let first = store
            .write_bucket(&table(), &BucketKey::new("p1", 0), &[record("1")])
            .unwrap();
        store.commit(&table(), &manifest_for(first, "p1", 1)).unwrap();
        let other = store
            .write_bucket(&table(), &BucketKey::new("p2", 0), &[record("9")])
            .unwrap();
        store.commit(&table(), &manifest_for(other, "p2", 2)).unwrap();

        let replacement = store
            .write_bucket(&table(), &BucketKey::new("p1", 0), &[record("2")])
            .unwrap();
        let mut manifest = ManifestCommittable::new("user", 3).with_kind(CommitKind::Overwrite {
            partition: Some("p1".to_string()),
        });
        manifest
            .add(Committable::new(
                table(),
                3,
                CommittableKind::NewFiles(NewFilesIncrement {
                    partition: "p1".to_string(),
                    bucket: 0,
                    new_files: vec![replacement],
                }),
            ))
            .unwrap();
        store.commit(&table(), &manifest).unwrap();

        let p1_rows = store.partition_rows(&table(), "p1");
        assert_eq!(p1_rows.len(), 1);
        assert_eq!(p1_rows[0].fields["id"], "2");
        // Other partitions are untouched.
        assert_eq!(store.partition_rows(&table(), "p2").len(), 1);
    }

    #[test]
    fn lock_reports_contention() {
        let factory = MemoryLockFactory::shared();
        let first = factory.create_lock().unwrap();
        let second = factory.create_lock().unwrap();
        first.acquire().unwrap();
        let err = second.acquire().unwrap_err();
        assert!(err.is_retryable());
        first.release().unwrap();
        second.acquire().unwrap();
        second.release().unwrap();
    }
}
