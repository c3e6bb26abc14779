//! Table schemas and schema evolution.
//!
//! A table's schema is versioned; a schema change is itself an ordered, committed event.
//! [`schema_changes`] computes the ordered change set needed to make a current schema cover a set
//! of updated fields, applying the widening rules: unknown columns are added, and a column's type
//! may only grow within its family (integer widening, float widening). Anything else (narrowing,
//! cross-family conversion) is a structural error that must fail the job rather than silently
//! drop or corrupt fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{Error, SinkResult};

/// Data types the sink kernel can route and evolve. Encoding values into these types is the
/// storage collaborator's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DataTypeKind {
    Boolean,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    String,
    Date,
    Timestamp,
}

impl DataTypeKind {
    /// Rank within the integer widening chain, if this is an integer type.
    fn int_rank(&self) -> Option<u8> {
        match self {
            DataTypeKind::TinyInt => Some(0),
            DataTypeKind::SmallInt => Some(1),
            DataTypeKind::Int => Some(2),
            DataTypeKind::BigInt => Some(3),
            _ => None,
        }
    }

    /// Whether a value of `self` can be losslessly widened to `to`.
    pub fn can_widen_to(&self, to: DataTypeKind) -> bool {
        if *self == to {
            return true;
        }
        match (self.int_rank(), to.int_rank()) {
            (Some(from), Some(to)) => from < to,
            _ => matches!((self, to), (DataTypeKind::Float, DataTypeKind::Double)),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub name: String,
    pub data_type: DataTypeKind,
}

impl DataField {
    pub fn new(name: impl Into<String>, data_type: DataTypeKind) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// How records of a table map to buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketMode {
    /// A fixed number of buckets per partition; the only mode the sink kernel supports.
    Fixed,
    /// Buckets assigned dynamically by an index.
    Dynamic,
    /// Appends without bucketing.
    Unaware,
}

/// The versioned schema of a sink table.
///
/// `id` increases with every applied schema change. `partition_keys` name the columns whose
/// values form the partition of a record; `primary_keys` drive the bucket assignment;
/// `num_buckets` is the fixed bucket count per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: u64,
    pub fields: Vec<DataField>,
    pub partition_keys: Vec<String>,
    pub primary_keys: Vec<String>,
    pub num_buckets: u32,
}

impl TableSchema {
    pub fn new(
        fields: Vec<DataField>,
        partition_keys: Vec<String>,
        primary_keys: Vec<String>,
        num_buckets: u32,
    ) -> Self {
        Self {
            id: 0,
            fields,
            partition_keys,
            primary_keys,
            num_buckets,
        }
    }

    pub fn field(&self, name: &str) -> Option<&DataField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether every field name in `names` exists in this schema.
    pub fn covers<'a>(&self, mut names: impl Iterator<Item = &'a str>) -> bool {
        names.all(|name| self.field(name).is_some())
    }

    /// Field names not covered by this schema.
    pub fn missing_fields<'a>(&self, names: impl Iterator<Item = &'a str>) -> Vec<String> {
        names
            .filter(|name| self.field(name).is_none())
            .map(str::to_string)
            .collect()
    }

    pub fn bucket_mode(&self) -> BucketMode {
        if self.num_buckets > 0 {
            BucketMode::Fixed
        } else if self.primary_keys.is_empty() {
            BucketMode::Unaware
        } else {
            BucketMode::Dynamic
        }
    }

    /// Apply an ordered change set, bumping the schema id once.
    pub fn apply(&mut self, changes: &[SchemaChange]) {
        for change in changes {
            match change {
                SchemaChange::AddColumn(field) => self.fields.push(field.clone()),
                SchemaChange::UpdateColumnType { name, new_type } => {
                    if let Some(field) = self.fields.iter_mut().find(|f| &f.name == name) {
                        field.data_type = *new_type;
                    }
                }
            }
        }
        self.id += 1;
    }
}

/// A single, ordered schema-change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaChange {
    AddColumn(DataField),
    UpdateColumnType {
        name: String,
        new_type: DataTypeKind,
    },
}

/// Compute the ordered change set that makes `current` cover `updated_fields`.
///
/// Returns an empty set when the schema already covers the fields. Returns
/// [`Error::SchemaIncompatible`] when a field would require narrowing or a cross-family
/// conversion; schema drift must never be silently skipped.
pub fn schema_changes(
    table: &str,
    current: &TableSchema,
    updated_fields: &[DataField],
) -> SinkResult<Vec<SchemaChange>> {
    let existing: BTreeMap<&str, DataTypeKind> = current
        .fields
        .iter()
        .map(|f| (f.name.as_str(), f.data_type))
        .collect();

    let mut changes = Vec::new();
    for field in updated_fields {
        match existing.get(field.name.as_str()) {
            None => changes.push(SchemaChange::AddColumn(field.clone())),
            Some(current_type) if *current_type == field.data_type => {}
            Some(current_type) if current_type.can_widen_to(field.data_type) => {
                changes.push(SchemaChange::UpdateColumnType {
                    name: field.name.clone(),
                    new_type: field.data_type,
                });
            }
            Some(current_type) => {
                return Err(Error::schema_incompatible(
                    table,
                    format!(
                        "cannot convert column {} from {} to {}",
                        field.name, current_type, field.data_type
                    ),
                ));
            }
        }
    }
    Ok(changes)
}
