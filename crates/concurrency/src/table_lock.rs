//! Shared-cache table locks
//!
//! Connections that share a page cache also take per-table read/write locks
//! when a statement runs. This is a second, independent automaton: the lock
//! manager consults it in addition to the file lock, never instead of it.
//!
//! Table locks are refused immediately (the engine does not invoke its busy
//! handler for them) and the refusal names the table, which is how a
//! table-level conflict is told apart from a whole-file lock.

use lockstep_core::{ConnectionId, LockError, LockResult, TableLockMode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lock state of one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLock {
    /// Connections holding the table read lock
    pub readers: BTreeSet<ConnectionId>,
    /// Connection holding the table write lock
    pub writer: Option<ConnectionId>,
}

impl TableLock {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }

    fn mode_of(&self, conn: ConnectionId) -> Option<TableLockMode> {
        if self.writer == Some(conn) {
            Some(TableLockMode::Write)
        } else if self.readers.contains(&conn) {
            Some(TableLockMode::Read)
        } else {
            None
        }
    }
}

/// Table locks of one shared cache, keyed by table name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableLocks {
    tables: BTreeMap<String, TableLock>,
}

impl TableLocks {
    /// Create an empty table-lock set
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock held by `conn` on `table`
    pub fn mode_of(&self, conn: ConnectionId, table: &str) -> Option<TableLockMode> {
        self.tables.get(table).and_then(|t| t.mode_of(conn))
    }

    /// Current lock of a table, if anyone holds one
    pub fn table(&self, table: &str) -> Option<&TableLock> {
        self.tables.get(table)
    }

    /// All locked tables
    pub fn tables(&self) -> &BTreeMap<String, TableLock> {
        &self.tables
    }

    /// True if no table lock is held by anyone
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Acquire a table lock
    ///
    /// `Read` is refused whenever another connection holds the table's
    /// write lock. `Write` is refused while any other connection holds any
    /// lock on the table. Returns the mode `conn` ends up holding (a writer
    /// asking to read keeps its write lock).
    pub fn acquire(
        &mut self,
        conn: ConnectionId,
        table: &str,
        mode: TableLockMode,
    ) -> LockResult<TableLockMode> {
        let entry = self.tables.get(table);
        let current = entry.and_then(|t| t.mode_of(conn));

        if current == Some(TableLockMode::Write) {
            return Ok(TableLockMode::Write);
        }
        if current == Some(mode) {
            return Ok(mode);
        }

        if let Some(lock) = entry {
            let blocker = match mode {
                TableLockMode::Read => lock.writer.filter(|w| *w != conn),
                TableLockMode::Write => lock
                    .writer
                    .filter(|w| *w != conn)
                    .or_else(|| lock.readers.iter().copied().find(|r| *r != conn)),
            };
            if let Some(holder) = blocker {
                return Err(LockError::TableLocked {
                    conn,
                    table: table.to_string(),
                    mode,
                    holder,
                });
            }
        }

        let lock = self.tables.entry(table.to_string()).or_default();
        match mode {
            TableLockMode::Read => {
                lock.readers.insert(conn);
            }
            TableLockMode::Write => {
                lock.readers.remove(&conn);
                lock.writer = Some(conn);
            }
        }
        Ok(mode)
    }

    /// Drop every table lock held by `conn`. Idempotent.
    pub fn release(&mut self, conn: ConnectionId) {
        for lock in self.tables.values_mut() {
            lock.readers.remove(&conn);
            if lock.writer == Some(conn) {
                lock.writer = None;
            }
        }
        self.tables.retain(|_, lock| !lock.is_empty());
    }

    /// Check that no table has a writer alongside another reader
    pub fn validate(&self) -> Result<(), String> {
        for (name, lock) in &self.tables {
            if let Some(w) = lock.writer {
                if let Some(r) = lock.readers.iter().find(|r| **r != w) {
                    return Err(format!(
                        "table {} write-locked by {} while {} reads it",
                        name, w, r
                    ));
                }
            }
        }
        Ok(())
    }
}
