//! The catalog collaborator: table metadata, schema changes, and the optional commit lock.
//!
//! The kernel never talks to a metastore directly; it goes through [`Catalog`]. Lock acquisition
//! is modeled as an explicit capability ([`LockFactory`] producing [`CatalogLock`]s) injected into
//! the coordinator rather than a process-wide singleton, so hosts can plug in their metastore's
//! advisory lock or run without one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::{SchemaChange, TableSchema};
use crate::SinkResult;

/// Fully qualified table name: `database.table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub database: String,
    pub table: String,
}

impl Identifier {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// The catalog/metastore contract the commit core requires.
///
/// Failures propagate as fatal unless explicitly retryable (see
/// [`Error::is_retryable`](crate::Error::is_retryable)).
pub trait Catalog: Send + Sync {
    /// The current schema of `identifier`, or [`Error::TableNotFound`](crate::Error).
    fn table_schema(&self, identifier: &Identifier) -> SinkResult<TableSchema>;

    /// Create a table. With `ignore_if_exists`, creating an existing table is a no-op.
    fn create_table(
        &self,
        identifier: &Identifier,
        schema: TableSchema,
        ignore_if_exists: bool,
    ) -> SinkResult<()>;

    /// Apply an ordered schema-change set and return the new schema. The change must be fully
    /// committed in the catalog before this returns.
    fn apply_schema_change(
        &self,
        identifier: &Identifier,
        changes: &[SchemaChange],
    ) -> SinkResult<TableSchema>;
}

/// An advisory lock scoped around a table's metadata mutation.
pub trait CatalogLock: Send {
    fn acquire(&self) -> SinkResult<()>;
    fn release(&self) -> SinkResult<()>;
}

/// Creates [`CatalogLock`]s for the coordinator. `None` means commits run unlocked.
pub trait LockFactory: Send + Sync {
    fn create_lock(&self) -> Option<Box<dyn CatalogLock>>;
}

/// A factory that never produces a lock.
#[derive(Debug, Default)]
pub struct EmptyLockFactory;

impl LockFactory for EmptyLockFactory {
    fn create_lock(&self) -> Option<Box<dyn CatalogLock>> {
        None
    }
}

impl EmptyLockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

/// Run `f` while holding `lock`, if one is configured. The lock is released on both success and
/// failure paths before the result propagates.
pub fn run_with_lock<T>(
    lock: Option<&dyn CatalogLock>,
    f: impl FnOnce() -> SinkResult<T>,
) -> SinkResult<T> {
    match lock {
        None => f(),
        Some(lock) => {
            lock.acquire()?;
            let result = f();
            let released = lock.release();
            match result {
                Ok(value) => {
                    released?;
                    Ok(value)
                }
                // The original failure wins over a release failure.
                Err(e) => Err(e),
            }
        }
    }
}
