//! StateStore — redb-backed instance persistence for Cirrus.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// The store contract the reconciler depends on.
pub trait InstanceStore {
    /// Every instance record, ordered by id.
    fn get_all(&self) -> StateResult<Vec<Instance>>;

    /// Insert or replace one record.
    ///
    /// `instance.version` must equal the stored version (0 for a new
    /// record). Returns the record as stored, with its bumped version.
    fn upsert(&self, instance: &Instance) -> StateResult<Instance>;

    /// Apply a whole batch atomically, with the same version checks.
    fn apply(&self, batch: &InstanceBatch) -> StateResult<()>;
}

/// Upserts and deletes committed together.
#[derive(Debug, Clone, Default)]
pub struct InstanceBatch {
    pub upserts: Vec<Instance>,
    /// `(instance id, version read at)`.
    pub deletes: Vec<(InstanceId, u64)>,
}

impl InstanceBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Thread-safe instance store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let instance: Instance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(instance))
            }
            None => Ok(None),
        }
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "instance deleted");
        Ok(existed)
    }
}

/// Version currently stored for `id` (0 when absent).
fn stored_version<T>(table: &T, id: &str) -> StateResult<u64>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => {
            let current: Instance =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(current.version)
        }
        None => Ok(0),
    }
}

fn check_version<T>(table: &T, id: &str, expected: u64) -> StateResult<()>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let found = stored_version(table, id)?;
    if found != expected {
        return Err(StateError::VersionConflict {
            id: id.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Version-check `instance` and serialize the copy to be stored.
fn prepare_write<T>(table: &T, instance: &Instance) -> StateResult<(Instance, Vec<u8>)>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    check_version(table, &instance.id, instance.version)?;
    let mut stored = instance.clone();
    stored.version = instance.version + 1;
    let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
    Ok((stored, value))
}

impl InstanceStore for StateStore {
    fn get_all(&self) -> StateResult<Vec<Instance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let instance: Instance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(instance);
        }
        Ok(results)
    }

    fn upsert(&self, instance: &Instance) -> StateResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let (prepared, value) = prepare_write(&table, instance)?;
            table
                .insert(prepared.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            stored = prepared;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %stored.id, status = %stored.status, version = stored.version, "instance stored");
        Ok(stored)
    }

    fn apply(&self, batch: &InstanceBatch) -> StateResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            for instance in &batch.upserts {
                let (prepared, value) = prepare_write(&table, instance)?;
                table
                    .insert(prepared.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for (id, version) in &batch.deletes {
                check_version(&table, id, *version)?;
                table.remove(id.as_str()).map_err(map_err!(Write))?;
            }
        }
        // Returning early above drops `txn`, which aborts every write in it.
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            upserts = batch.upserts.len(),
            deletes = batch.deletes.len(),
            "instance batch committed"
        );
        Ok(())
    }
}
