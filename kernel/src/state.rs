//! The checkpoint-state interface.
//!
//! The host runtime hands each operator a named-cell byte store that is snapshotted at every
//! checkpoint and restored on restart. Cells must round-trip byte-for-byte: the bytes an operator
//! puts are exactly the bytes it gets back after a snapshot/restore cycle. The kernel persists
//! three things through this interface: the commit-user string, writer bucket-ownership
//! parameters, and the coordinator's pending committable aggregate.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, SinkResult};

/// State cell holding the per-job commit-user identity.
pub const COMMIT_USER_STATE: &str = "commit_user_state";
/// State cell holding a writer instance's recovered bucket-ownership parameters.
pub const WRITER_STATE: &str = "writer_state";
/// State cell holding the coordinator's pending committable aggregates.
pub const PENDING_COMMITTABLES_STATE: &str = "pending_committables_state";

/// A named-cell byte store persisted by the host at checkpoint boundaries.
pub trait StateBackend: Send {
    fn get(&self, name: &str) -> Option<&[u8]>;
    fn put(&mut self, name: &str, bytes: Vec<u8>);
}

/// Serialize `value` into the named cell.
pub fn put_value<T: Serialize>(
    backend: &mut dyn StateBackend,
    name: &str,
    value: &T,
) -> SinkResult<()> {
    let bytes = serde_json::to_vec(value)?;
    backend.put(name, bytes);
    Ok(())
}

/// Deserialize the named cell, if present. A present-but-undecodable cell is corrupted state.
pub fn get_value<T: DeserializeOwned>(
    backend: &dyn StateBackend,
    name: &str,
) -> SinkResult<Option<T>> {
    match backend.get(name) {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(bytes)
            .map(Some)
            .map_err(|e| Error::state_corrupted(format!("state cell {name}: {e}"))),
    }
}

/// Recover the single value stored under `name`, initializing it with `init` on first run.
///
/// This is how the commit user is managed: generated once, then immutable across restarts;
/// the recovered value always wins over the initial one.
pub fn single_value_or_init<T: Serialize + DeserializeOwned>(
    backend: &mut dyn StateBackend,
    name: &str,
    init: impl FnOnce() -> T,
) -> SinkResult<T> {
    match get_value(backend, name)? {
        Some(value) => Ok(value),
        None => {
            let value = init();
            put_value(backend, name, &value)?;
            Ok(value)
        }
    }
}

/// In-memory [`StateBackend`] used by tests and single-process hosts. [`Self::checkpoint`]
/// captures the backing bytes so a restart can be simulated by restoring from the capture.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateBackend {
    cells: std::collections::BTreeMap<String, Vec<u8>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current cell contents, byte-for-byte.
    pub fn checkpoint(&self) -> MemoryStateBackend {
        self.clone()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get(&self, name: &str) -> Option<&[u8]> {
        self.cells.get(name).map(Vec::as_slice)
    }

    fn put(&mut self, name: &str, bytes: Vec<u8>) {
        self.cells.insert(name.to_string(), bytes);
    }
}
