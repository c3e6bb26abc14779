//! The multiplexed writer: one operator handling every table discovered at runtime.
//!
//! Per-table writer state is a runtime map keyed by [`Identifier`]; adding a table never changes
//! the job topology. Each table moves through `Unknown` (not yet in the catalog; created on first
//! sight) → `Active` (records flow to its writer) → back through a schema refresh whenever a
//! record's fields outgrow the cached schema. If the catalog still does not cover the record, the
//! record is rejected with a retryable [`Error::SchemaNotReady`] so the host redelivers it after
//! the schema-apply stage acknowledges the change; the write path never blocks waiting for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::catalog::{Catalog, Identifier};
use crate::cdc::{CdcRecord, MultiplexCdcRecord};
use crate::channel::ChannelComputer;
use crate::committable::CommittableBatch;
use crate::record::SinkRecord;
use crate::schema::{DataField, DataTypeKind, TableSchema};
use crate::state::{single_value_or_init, StateBackend, COMMIT_USER_STATE};
use crate::store::FileStoreWrite;
use crate::utils::require;
use crate::writer::StoreSinkWrite;
use crate::{CheckpointId, Error, SinkResult};

/// Schema a table gets when its first sighting is a bare data record: every field is a string,
/// no partition keys, bucketing over all fields.
fn schema_from_record(record: &CdcRecord, num_buckets: u32) -> TableSchema {
    let fields = record
        .field_names()
        .map(|name| DataField::new(name, DataTypeKind::String))
        .collect();
    TableSchema::new(fields, Vec::new(), Vec::new(), num_buckets)
}

/// Routing-side channel computation for multiplexed CDC records.
///
/// Uses the same schema-driven bucket extraction as the receiving side, with a per-table schema
/// cache refreshed whenever a record's fields outgrow the cached schema.
pub struct CdcMultiplexChannelComputer {
    catalog: Arc<dyn Catalog>,
    channel_computer: ChannelComputer,
    default_num_buckets: u32,
    schemas: BTreeMap<Identifier, TableSchema>,
}

impl std::fmt::Debug for CdcMultiplexChannelComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcMultiplexChannelComputer")
            .field("channel_computer", &self.channel_computer)
            .field("default_num_buckets", &self.default_num_buckets)
            .field("schemas", &self.schemas)
            .finish_non_exhaustive()
    }
}

impl CdcMultiplexChannelComputer {
    pub fn new(catalog: Arc<dyn Catalog>, num_channels: usize, default_num_buckets: u32) -> Self {
        Self {
            catalog,
            channel_computer: ChannelComputer::new(num_channels),
            default_num_buckets,
            schemas: BTreeMap::new(),
        }
    }

    /// The writer instance `record` must be sent to.
    pub fn channel(&mut self, record: &MultiplexCdcRecord) -> SinkResult<usize> {
        let routed = route_record(
            &self.catalog,
            &mut self.schemas,
            self.default_num_buckets,
            record,
        )?;
        Ok(self.channel_computer.channel(&routed.bucket_key()))
    }
}

/// Resolve (and cache) the table's schema, creating the table on first sight, then route the
/// record. A stale cached schema is refreshed once before giving up with `SchemaNotReady`.
fn route_record(
    catalog: &Arc<dyn Catalog>,
    schemas: &mut BTreeMap<Identifier, TableSchema>,
    default_num_buckets: u32,
    record: &MultiplexCdcRecord,
) -> SinkResult<SinkRecord> {
    if !schemas.contains_key(&record.table) {
        let schema = match catalog.table_schema(&record.table) {
            Ok(schema) => schema,
            Err(Error::TableNotFound(_)) => {
                // Unknown -> Active: first event for a table not yet in the target catalog.
                info!(table = %record.table, "creating table discovered in CDC stream");
                catalog.create_table(
                    &record.table,
                    schema_from_record(&record.record, default_num_buckets),
                    true,
                )?;
                catalog.table_schema(&record.table)?
            }
            Err(e) => return Err(e),
        };
        schemas.insert(record.table.clone(), schema);
    }

    let schema = schemas.get(&record.table).expect("just inserted");
    match record.record.to_sink_record(&record.table, schema) {
        Err(Error::SchemaNotReady { .. }) => {
            // The schema-apply stage may have committed a change since we cached; refresh once.
            let refreshed = catalog.table_schema(&record.table)?;
            debug!(table = %record.table, schema_id = refreshed.id, "refreshed schema after coverage miss");
            let routed = record.record.to_sink_record(&record.table, &refreshed);
            schemas.insert(record.table.clone(), refreshed);
            routed
        }
        other => other,
    }
}

/// One instance of the multiplexed CDC write operator.
///
/// Holds a lazily grown map from table id to that table's [`StoreSinkWrite`]; at every checkpoint
/// snapshot it flushes all of them and emits one [`CommittableBatch`] covering every table.
pub struct CdcMultiplexWriteOperator {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn FileStoreWrite>,
    initial_commit_user: String,
    writer_index: usize,
    channel_computer: ChannelComputer,
    default_num_buckets: u32,
    commit_user: Option<String>,
    writes: BTreeMap<Identifier, StoreSinkWrite>,
    schemas: BTreeMap<Identifier, TableSchema>,
}

impl std::fmt::Debug for CdcMultiplexWriteOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcMultiplexWriteOperator")
            .field("initial_commit_user", &self.initial_commit_user)
            .field("writer_index", &self.writer_index)
            .field("channel_computer", &self.channel_computer)
            .field("default_num_buckets", &self.default_num_buckets)
            .field("commit_user", &self.commit_user)
            .field("schemas", &self.schemas)
            .finish_non_exhaustive()
    }
}

impl CdcMultiplexWriteOperator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn FileStoreWrite>,
        initial_commit_user: impl Into<String>,
        writer_index: usize,
        num_channels: usize,
        default_num_buckets: u32,
    ) -> Self {
        Self {
            catalog,
            store,
            initial_commit_user: initial_commit_user.into(),
            writer_index,
            channel_computer: ChannelComputer::new(num_channels),
            default_num_buckets,
            commit_user: None,
            writes: BTreeMap::new(),
            schemas: BTreeMap::new(),
        }
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Tables this instance has created writers for.
    pub fn tables(&self) -> Vec<Identifier> {
        self.writes.keys().cloned().collect()
    }

    /// Recover the commit-user identity; valid only once per job, consistent across restarts.
    pub fn initialize(&mut self, backend: &mut dyn StateBackend) -> SinkResult<()> {
        let initial = self.initial_commit_user.clone();
        let commit_user: String =
            single_value_or_init(backend, COMMIT_USER_STATE, move || initial)?;
        info!(
            commit_user,
            writer_index = self.writer_index,
            "multiplex writer initialized"
        );
        self.commit_user = Some(commit_user);
        Ok(())
    }

    /// Ingest one multiplexed record: resolve its table (creating it on first sight), enforce the
    /// schema-coverage gate and bucket ownership, then buffer it in the table's writer.
    pub fn process(&mut self, record: MultiplexCdcRecord) -> SinkResult<()> {
        let commit_user = self
            .commit_user
            .clone()
            .ok_or_else(|| Error::generic("multiplex writer used before initialize"))?;

        let routed = route_record(
            &self.catalog,
            &mut self.schemas,
            self.default_num_buckets,
            &record,
        )?;
        let key = routed.bucket_key();
        require!(
            self.channel_computer.owns(self.writer_index, &key),
            Error::bucket_ownership(format!(
                "record of table {} for bucket {key} routed to writer {} which owns channel {}",
                record.table,
                self.writer_index,
                self.channel_computer.channel(&key)
            ))
        );

        let write = self.writes.entry(record.table.clone()).or_insert_with(|| {
            debug!(table = %record.table, "opening writer for newly seen table");
            StoreSinkWrite::new(record.table.clone(), commit_user, self.store.clone())
        });
        write.write(routed);
        Ok(())
    }

    /// Flush every table's writer and emit this instance's contribution for the checkpoint,
    /// even when no table produced anything.
    #[instrument(name = "multiplex_writer.snapshot", skip_all, fields(checkpoint_id, writer_index = self.writer_index), err)]
    pub fn snapshot(&mut self, checkpoint_id: CheckpointId) -> SinkResult<CommittableBatch> {
        let mut committables = Vec::new();
        for write in self.writes.values_mut() {
            // No compaction for the multiplexed sink.
            committables.extend(write.prepare_commit(false, checkpoint_id)?);
        }
        Ok(CommittableBatch {
            writer_index: self.writer_index,
            checkpoint_id,
            committables,
        })
    }

    pub fn close(&mut self) {
        for write in self.writes.values_mut() {
            write.close();
        }
        self.writes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdc::SchemaChangeEvent;
    use crate::cdc::schema_applier::SchemaChangeApplier;
    use crate::engine::memory::{MemoryCatalog, MemoryFileStore};
    use crate::record::RowKind;
    use crate::state::MemoryStateBackend;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn data(table: &str, pairs: &[(&str, &str)]) -> MultiplexCdcRecord {
        MultiplexCdcRecord::new(
            Identifier::new("db", table),
            CdcRecord::new(RowKind::Insert, fields(pairs)),
        )
    }

    fn operator(
        catalog: &Arc<MemoryCatalog>,
        store: &Arc<MemoryFileStore>,
    ) -> CdcMultiplexWriteOperator {
        // Parallelism 1 so this instance owns every bucket.
        CdcMultiplexWriteOperator::new(catalog.clone(), store.clone(), "user", 0, 1, 4)
    }

    #[test]
    fn unknown_table_is_created_then_written() {
        let catalog = MemoryCatalog::shared();
        let store = MemoryFileStore::shared();
        let mut op = operator(&catalog, &store);
        let mut backend = MemoryStateBackend::new();
        op.initialize(&mut backend).unwrap();

        op.process(data("orders", &[("id", "1"), ("v", "a")])).unwrap();
        assert!(catalog.table_schema(&Identifier::new("db", "orders")).is_ok());
        assert_eq!(op.tables(), vec![Identifier::new("db", "orders")]);

        let batch = op.snapshot(1).unwrap();
        assert_eq!(batch.committables.len(), 1);
    }

    #[test]
    fn stale_schema_is_refreshed_after_applier_commits() {
        let catalog = MemoryCatalog::shared();
        let store = MemoryFileStore::shared();
        let mut op = operator(&catalog, &store);
        let mut backend = MemoryStateBackend::new();
        op.initialize(&mut backend).unwrap();

        // Seed the table and the operator's schema cache.
        op.process(data("t", &[("id", "1")])).unwrap();

        // The schema-apply stage lands the widening, then the dependent record arrives.
        let applier = SchemaChangeApplier::new(catalog.clone(), 4);
        applier
            .apply(&SchemaChangeEvent {
                table: Identifier::new("db", "t"),
                updated_fields: vec![
                    DataField::new("id", DataTypeKind::String),
                    DataField::new("note", DataTypeKind::String),
                ],
            })
            .unwrap();

        op.process(data("t", &[("id", "2"), ("note", "hi")])).unwrap();
        let batch = op.snapshot(1).unwrap();
        assert!(!batch.committables.is_empty());
    }

    #[test]
    fn record_ahead_of_schema_change_is_retryable() {
        let catalog = MemoryCatalog::shared();
        let store = MemoryFileStore::shared();
        let mut op = operator(&catalog, &store);
        let mut backend = MemoryStateBackend::new();
        op.initialize(&mut backend).unwrap();

        op.process(data("t", &[("id", "1")])).unwrap();
        // No schema change has been applied: the record must be rejected, retryably.
        let err = op.process(data("t", &[("id", "2"), ("note", "hi")])).unwrap_err();
        assert!(matches!(err, Error::SchemaNotReady { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn routing_and_ownership_agree() {
        let catalog = MemoryCatalog::shared();
        let store = MemoryFileStore::shared();
        let parallelism = 3;

        let mut computer = CdcMultiplexChannelComputer::new(catalog.clone(), parallelism, 4);
        let mut operators: Vec<CdcMultiplexWriteOperator> = (0..parallelism)
            .map(|index| {
                CdcMultiplexWriteOperator::new(
                    catalog.clone(),
                    store.clone(),
                    "user",
                    index,
                    parallelism,
                    4,
                )
            })
            .collect();
        let mut backend = MemoryStateBackend::new();
        for op in operators.iter_mut() {
            op.initialize(&mut backend).unwrap();
        }

        for i in 0..32 {
            let id = i.to_string();
            let record = data("t", &[("id", &id)]);
            let channel = computer.channel(&record).unwrap();
            operators[channel].process(record).unwrap();
        }
    }
}
