//! Defines [`Error`], the umbrella error type for everything the sink kernel can surface, and the
//! [`SinkResult`] alias used throughout the crate.
//!
//! Errors fall into three buckets that callers care about:
//! 1. transient-retryable (commit conflicts, momentary catalog unavailability, a schema the
//!    schema-apply stage has not committed yet), safe to retry with identical input;
//! 2. structural-fatal (incompatible schema change, corrupted committable state, bucket-ownership
//!    violations), which must surface as job failure;
//! 3. data-loss-risk (writer flush failure, unconfirmed commit outcome), resolved conservatively
//!    by re-attempting from recovered state.
//!
//! [`Error::is_retryable`] is the single place that classification lives.

use crate::CheckpointId;

/// A specialized [`Result`] type for sink kernel operations.
pub type SinkResult<T, E = Error> = std::result::Result<T, E>;

/// All the types of errors that can occur in the sink kernel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error for when something unexpected happened, with an explanation string.
    #[error("Generic sink error: {0}")]
    Generic(String),

    /// A concurrent committer won a race for the same table; retry with identical input.
    #[error("Commit conflict: {0}")]
    CommitConflict(String),

    /// The catalog (or the commit target behind it) could not be reached.
    #[error("Catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// A table referenced by a record or committable does not exist.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A schema change that cannot be applied (e.g. type narrowing).
    #[error("Incompatible schema change for table {table}: {message}")]
    SchemaIncompatible { table: String, message: String },

    /// A record depends on schema fields the catalog has not committed yet. The record must be
    /// redelivered once the schema-apply stage acknowledges the change.
    #[error("Schema of table {table} does not yet cover record fields {fields:?}")]
    SchemaNotReady { table: String, fields: Vec<String> },

    /// Recovered operator state does not deserialize or violates an invariant.
    #[error("Corrupted committable state: {0}")]
    StateCorrupted(String),

    /// A record or recovered bucket routed to a writer instance that does not own its bucket.
    #[error("Bucket ownership violation: {0}")]
    BucketOwnership(String),

    /// A writer failed to flush its buffers. Fatal; un-flushed buffers must never be dropped.
    #[error("Writer flush failed for checkpoint {checkpoint_id}: {message}")]
    FlushFailed {
        checkpoint_id: CheckpointId,
        message: String,
    },

    /// A feature or mode the kernel does not support.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// An error enountered while serializing or deserializing checkpoint state.
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    pub fn generic(msg: impl ToString) -> Self {
        Self::Generic(msg.to_string())
    }

    pub fn commit_conflict(msg: impl ToString) -> Self {
        Self::CommitConflict(msg.to_string())
    }

    pub fn catalog_unavailable(msg: impl ToString) -> Self {
        Self::CatalogUnavailable(msg.to_string())
    }

    pub fn table_not_found(table: impl ToString) -> Self {
        Self::TableNotFound(table.to_string())
    }

    pub fn schema_incompatible(table: impl ToString, message: impl ToString) -> Self {
        Self::SchemaIncompatible {
            table: table.to_string(),
            message: message.to_string(),
        }
    }

    pub fn state_corrupted(msg: impl ToString) -> Self {
        Self::StateCorrupted(msg.to_string())
    }

    pub fn bucket_ownership(msg: impl ToString) -> Self {
        Self::BucketOwnership(msg.to_string())
    }

    pub fn flush_failed(checkpoint_id: CheckpointId, message: impl ToString) -> Self {
        Self::FlushFailed {
            checkpoint_id,
            message: message.to_string(),
        }
    }

    pub fn unsupported(msg: impl ToString) -> Self {
        Self::Unsupported(msg.to_string())
    }

    /// Whether a commit attempt that failed with this error may be retried with the same
    /// idempotent input. Everything else is structural and must fail the job.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommitConflict(_) | Self::CatalogUnavailable(_) | Self::SchemaNotReady { .. }
        )
    }
}
