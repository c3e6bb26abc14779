//! Row-level record types flowing into the sink.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::channel::BucketKey;

/// The change kind of a row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RowKind {
    Insert,
    UpdateBefore,
    UpdateAfter,
    Delete,
}

impl RowKind {
    /// Whether this kind adds data (as opposed to retracting it).
    pub fn is_add(&self) -> bool {
        matches!(self, RowKind::Insert | RowKind::UpdateAfter)
    }
}

/// A single row mutation, already routed: it carries the partition value and bucket id that
/// together form its [`BucketKey`].
///
/// Field values are kept as strings keyed by column name. The sink kernel never interprets the
/// values; encoding them into the columnar file format is the storage collaborator's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub kind: RowKind,
    pub partition: String,
    pub bucket: u32,
    pub fields: BTreeMap<String, String>,
}

impl SinkRecord {
    pub fn new(
        kind: RowKind,
        partition: impl Into<String>,
        bucket: u32,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            kind,
            partition: partition.into(),
            bucket,
            fields,
        }
    }

    /// The bucket key this record belongs to. Every record maps to exactly one bucket key.
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey::new(self.partition.clone(), self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_kind_add_semantics() {
        assert!(RowKind::Insert.is_add());
        assert!(RowKind::UpdateAfter.is_add());
        assert!(!RowKind::UpdateBefore.is_add());
        assert!(!RowKind::Delete.is_add());
    }

    #[test]
    fn row_kind_display() {
        assert_eq!(RowKind::UpdateBefore.to_string(), "UPDATE_BEFORE");
    }
}
