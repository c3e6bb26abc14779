//! The schema-change barrier stage.
//!
//! Runs at parallelism 1, downstream of the same ordered partition point as the data events, so
//! for any table a schema change is committed to the catalog before the records depending on it
//! reach a writer. Widening changes (new columns, type growth) are applied; an incompatible
//! change fails the job; schema drift must never be silently skipped.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::catalog::Catalog;
use crate::cdc::SchemaChangeEvent;
use crate::schema::{schema_changes, TableSchema};
use crate::{Error, SinkResult};

/// Applies [`SchemaChangeEvent`]s to the catalog, creating tables discovered mid-stream.
pub struct SchemaChangeApplier {
    catalog: Arc<dyn Catalog>,
    default_num_buckets: u32,
}

impl std::fmt::Debug for SchemaChangeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChangeApplier")
            .field("default_num_buckets", &self.default_num_buckets)
            .finish_non_exhaustive()
    }
}

impl SchemaChangeApplier {
    pub fn new(catalog: Arc<dyn Catalog>, default_num_buckets: u32) -> Self {
        Self {
            catalog,
            default_num_buckets,
        }
    }

    /// Apply one schema-change event and return the table's schema afterwards.
    ///
    /// Once this returns, the change is committed in the catalog and acknowledged: writers
    /// refreshing the table's schema will observe it, and records depending on it may be
    /// accepted. Any catalog failure propagates fatally.
    #[instrument(name = "schema_applier.apply", skip_all, fields(table = %event.table), err)]
    pub fn apply(&self, event: &SchemaChangeEvent) -> SinkResult<TableSchema> {
        let current = match self.catalog.table_schema(&event.table) {
            Ok(schema) => schema,
            Err(Error::TableNotFound(_)) => {
                info!("creating table discovered in CDC stream");
                let schema = TableSchema::new(
                    event.updated_fields.clone(),
                    Vec::new(),
                    Vec::new(),
                    self.default_num_buckets,
                );
                self.catalog.create_table(&event.table, schema, true)?;
                return self.catalog.table_schema(&event.table);
            }
            Err(e) => return Err(e),
        };

        let changes = schema_changes(&event.table.to_string(), &current, &event.updated_fields)?;
        if changes.is_empty() {
            debug!("schema already covers the updated fields");
            return Ok(current);
        }
        info!(change_count = changes.len(), "applying schema changes");
        self.catalog.apply_schema_change(&event.table, &changes)
    }
}
