use crate::core::db;
use crate::core::error;
use rusqlite::{Connection, TransactionBehavior};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LockResult, Mutex, MutexGuard};

/// The DB Broker is the "Thin Waist" for state access.
///
/// Reads go straight to a fresh connection. Mutations are serialized per
/// document: the broker hands out one lock per subject key and runs the
/// closure inside an immediate transaction that commits only on `Ok`.
#[derive(Clone)]
pub struct DbBroker {
    db_path: PathBuf,
    locks: Arc<LockTable>,
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn slot(&self, subject: &str) -> Arc<Mutex<()>> {
        let mut slots = recover(self.slots.lock());
        Arc::clone(
            slots
                .entry(subject.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the slot once nobody but the table holds it.
    fn release(&self, subject: &str, slot: Arc<Mutex<()>>) {
        let mut slots = recover(self.slots.lock());
        if let Some(held) = slots.get(subject)
            && Arc::ptr_eq(held, &slot)
            && Arc::strong_count(held) == 2
        {
            slots.remove(subject);
        }
    }

    fn len(&self) -> usize {
        recover(self.slots.lock()).len()
    }
}

fn recover<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            db_path: db::keelson_db_path(root),
            locks: Arc::new(LockTable::default()),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Execute a read-only closure against a fresh connection.
    pub fn with_conn<F, R>(&self, op_name: &str, f: F) -> Result<R, error::KeelsonError>
    where
        F: FnOnce(&Connection) -> Result<R, error::KeelsonError>,
    {
        let conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let result = f(&conn);
        tracing::debug!(op = op_name, ok = result.is_ok(), "broker read");
        result
    }

    /// Execute a mutation for one subject under its lock, inside a single
    /// transaction. Nothing is written unless the closure returns `Ok`.
    pub fn with_subject_tx<F, R>(
        &self,
        subject: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::KeelsonError>
    where
        F: FnOnce(&Connection) -> Result<R, error::KeelsonError>,
    {
        let slot = self.locks.slot(subject);
        let result = {
            let _guard = recover(slot.lock());
            self.run_tx(f)
        };
        self.locks.release(subject, slot);

        match &result {
            Ok(_) => tracing::debug!(op = op_name, subject, "broker commit"),
            Err(e) => tracing::debug!(op = op_name, subject, error = %e, "broker rollback"),
        }
        result
    }

    fn run_tx<F, R>(&self, f: F) -> Result<R, error::KeelsonError>
    where
        F: FnOnce(&Connection) -> Result<R, error::KeelsonError>,
    {
        let mut conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Number of live lock slots; idle slots are pruned after each mutation.
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }
}
