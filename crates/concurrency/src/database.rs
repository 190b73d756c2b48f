//! Simulated databases and the per-run registry
//!
//! A `Database` is only what the lock protocol needs: its name, its lock
//! manager, and how many rows each table has had committed (so a run can
//! tell whether a write actually landed). Storage internals are not modeled.
//!
//! The `DatabaseRegistry` is an explicit object owned by a run. Connections
//! that name the same database get the same `Arc<Database>` and therefore
//! contend on the same lock manager; there is no process-wide singleton.

use crate::lock_manager::{LockManager, LockSession};
use dashmap::DashMap;
use lockstep_core::{ConnectionId, DatabaseName, LockError, LockLevel, LockResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One simulated database
#[derive(Debug)]
pub struct Database {
    name: DatabaseName,
    locks: LockManager,
    rows: Mutex<BTreeMap<String, u64>>,
}

impl Database {
    /// Create an empty, unlocked database
    pub fn new(name: DatabaseName) -> Self {
        Self {
            locks: LockManager::new(name.clone()),
            name,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Database name
    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    /// The database's lock manager
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Rows committed to one table
    pub fn committed_rows(&self, table: &str) -> u64 {
        self.rows.lock().get(table).copied().unwrap_or(0)
    }

    /// Rows committed across all tables
    pub fn total_rows(&self) -> u64 {
        self.rows.lock().values().sum()
    }

    /// Committed row counts per table
    pub fn rows(&self) -> BTreeMap<String, u64> {
        self.rows.lock().clone()
    }

    /// Apply a writer's buffered rows
    ///
    /// Only legal while `conn` holds EXCLUSIVE. Runs under the caller's
    /// session so the check and the write land in the same critical section.
    pub(crate) fn apply_rows(
        &self,
        locks: &LockSession<'_>,
        conn: ConnectionId,
        rows: &BTreeMap<String, u64>,
    ) -> LockResult<u64> {
        let held = locks.level_of(conn);
        if held != LockLevel::Exclusive {
            return Err(LockError::InvalidTransition {
                conn,
                from: held,
                to: LockLevel::Exclusive,
            });
        }

        let mut committed = self.rows.lock();
        let mut applied: u64 = 0;
        for (table, count) in rows {
            *committed.entry(table.clone()).or_insert(0) += *count;
            applied += *count;
        }
        debug!(db = %self.name, %conn, rows = applied, "rows committed");
        Ok(applied)
    }

    /// Forget all locks and rows
    pub fn reset(&self) {
        self.locks.reset();
        self.rows.lock().clear();
    }
}

/// Databases opened during one run, keyed by name
#[derive(Debug, Default)]
pub struct DatabaseRegistry {
    databases: DashMap<DatabaseName, Arc<Database>>,
}

impl DatabaseRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a database by name, creating it on first use
    pub fn open(&self, name: &DatabaseName) -> Arc<Database> {
        let entry = self
            .databases
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Database::new(name.clone())));
        Arc::clone(entry.value())
    }

    /// Look up an already opened database
    pub fn get(&self, name: &DatabaseName) -> Option<Arc<Database>> {
        self.databases.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Every opened database, ordered by name
    pub fn databases(&self) -> Vec<Arc<Database>> {
        let mut all: Vec<_> = self
            .databases
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of opened databases
    pub fn len(&self) -> usize {
        self.databases.len()
    }

    /// True if no database has been opened
    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}
