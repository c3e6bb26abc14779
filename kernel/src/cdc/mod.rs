//! Change-data-capture extension: multi-table records, schema-change events, and the multiplexed
//! writer that handles tables discovered only after the job starts.
//!
//! A CDC source produces one ordered stream of [`CdcEvent`]s per table: data events and
//! schema-change events as a tagged variant. The ordering within a table's sub-stream must be
//! preserved by the upstream partition/merge point; the kernel relies on it to enforce that a
//! schema change is applied and acknowledged before any record depending on it is written.

pub mod multiplex;
pub mod schema_applier;

pub use multiplex::{CdcMultiplexChannelComputer, CdcMultiplexWriteOperator};
pub use schema_applier::SchemaChangeApplier;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::Identifier;
use crate::channel::stable_hash;
use crate::record::{RowKind, SinkRecord};
use crate::schema::{BucketMode, DataField, TableSchema};
use crate::utils::require;
use crate::{Error, SinkResult};

/// A single row mutation from a CDC source, not yet routed: field values keyed by column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcRecord {
    pub kind: RowKind,
    pub fields: BTreeMap<String, String>,
}

impl CdcRecord {
    pub fn new(kind: RowKind, fields: BTreeMap<String, String>) -> Self {
        Self { kind, fields }
    }

    /// Field names present in this record.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Route this record under `schema`: extract the partition from the schema's partition keys
    /// and assign the bucket from the primary-key values (or all fields for append-only tables).
    ///
    /// Returns [`Error::SchemaNotReady`] when the record carries fields the schema does not
    /// cover; the schema change must land in the catalog before this record may be written.
    pub fn to_sink_record(
        &self,
        table: &Identifier,
        schema: &TableSchema,
    ) -> SinkResult<SinkRecord> {
        let missing = schema.missing_fields(self.field_names());
        if !missing.is_empty() {
            return Err(Error::SchemaNotReady {
                table: table.to_string(),
                fields: missing,
            });
        }
        require!(
            schema.bucket_mode() == BucketMode::Fixed,
            Error::unsupported(format!(
                "table {table} has bucket mode {:?}; only Fixed is supported",
                schema.bucket_mode()
            ))
        );

        let partition = schema
            .partition_keys
            .iter()
            .map(|key| self.fields.get(key).cloned().unwrap_or_default())
            .collect::<Vec<_>>()
            .join("/");

        let bucket_keys: Vec<&String> = if schema.primary_keys.is_empty() {
            self.fields.values().collect()
        } else {
            schema
                .primary_keys
                .iter()
                .filter_map(|key| self.fields.get(key))
                .collect()
        };
        let mut bytes = Vec::new();
        for value in bucket_keys {
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        let bucket = (stable_hash(&bytes) % u64::from(schema.num_buckets)) as u32;

        Ok(SinkRecord::new(
            self.kind,
            partition,
            bucket,
            self.fields.clone(),
        ))
    }
}

/// A CDC record tagged with the table it belongs to, for the multiplexed sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexCdcRecord {
    pub table: Identifier,
    pub record: CdcRecord,
}

impl MultiplexCdcRecord {
    pub fn new(table: Identifier, record: CdcRecord) -> Self {
        Self { table, record }
    }
}

/// A schema-change request derived from the CDC stream: the fields the table must cover from now
/// on. Applied by the parallelism-1 [`SchemaChangeApplier`] stage before dependent records are
/// written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChangeEvent {
    pub table: Identifier,
    pub updated_fields: Vec<DataField>,
}

/// One element of a table's ordered CDC sub-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdcEvent {
    Data(MultiplexCdcRecord),
    SchemaChange(SchemaChangeEvent),
}

impl CdcEvent {
    pub fn table(&self) -> &Identifier {
        match self {
            CdcEvent::Data(record) => &record.table,
            CdcEvent::SchemaChange(event) => &event.table,
        }
    }
}

/// Parses raw source events into ordered [`CdcEvent`]s. One parser instance runs per source
/// partition; implementations decide how table names, row images, and schema hints map onto the
/// event model.
pub trait EventParser<T>: Send {
    fn parse(&mut self, raw: T) -> SinkResult<Vec<CdcEvent>>;
}
