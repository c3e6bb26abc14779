//! A number of utilities useful for testing that we want to use in multiple crates

use std::collections::BTreeMap;
use std::sync::Arc;

use sink_kernel::catalog::Identifier;
use sink_kernel::cdc::{CdcRecord, MultiplexCdcRecord};
use sink_kernel::engine::memory::{MemoryCatalog, MemoryFileStore, MemoryLockFactory};
use sink_kernel::record::{RowKind, SinkRecord};
use sink_kernel::schema::{DataField, DataTypeKind, TableSchema};

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;

/// Install a tracing subscriber writing to the test writer for the current scope.
pub fn init_test_logging() -> DefaultGuard {
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(false),
    );
    tracing::subscriber::set_default(subscriber)
}

/// The memory engine a test drives end-to-end: file store, catalog, lock factory.
pub struct MemoryEngine {
    pub store: Arc<MemoryFileStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub lock_factory: Arc<MemoryLockFactory>,
}

pub fn memory_engine() -> MemoryEngine {
    MemoryEngine {
        store: MemoryFileStore::shared(),
        catalog: MemoryCatalog::shared(),
        lock_factory: MemoryLockFactory::shared(),
    }
}

/// A partitioned, primary-keyed schema used across the test suites.
pub fn test_schema(num_buckets: u32) -> TableSchema {
    TableSchema::new(
        vec![
            DataField::new("dt", DataTypeKind::String),
            DataField::new("id", DataTypeKind::Int),
            DataField::new("v", DataTypeKind::String),
        ],
        vec!["dt".to_string()],
        vec!["id".to_string()],
        num_buckets,
    )
}

pub fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// An already-routed insert record.
pub fn sink_record(partition: &str, bucket: u32, id: &str) -> SinkRecord {
    SinkRecord::new(
        RowKind::Insert,
        partition,
        bucket,
        fields(&[("id", id)]),
    )
}

/// An insert CDC record for the multiplexed sink.
pub fn cdc_insert(database: &str, table: &str, pairs: &[(&str, &str)]) -> MultiplexCdcRecord {
    MultiplexCdcRecord::new(
        Identifier::new(database, table),
        CdcRecord::new(RowKind::Insert, fields(pairs)),
    )
}
