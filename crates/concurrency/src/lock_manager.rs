//! Lock manager for one simulated database
//!
//! Composes the file-lock automaton and the shared-cache table locks behind
//! a single mutex. That mutex is the one serialization point for every
//! acquire/release on the database, so all calls across all connections are
//! totally ordered.
//!
//! `LockManager::session` hands out the held mutex as a `LockSession`. A
//! connection runs one whole statement (every escalation, unwind and table
//! lock it needs) inside a single session, and the engine stamps the
//! statement's timeline entry before dropping it. Statements are therefore
//! atomic with respect to each other and entry order is lock order.
//!
//! ## Non-blocking contract
//!
//! Every `acquire_*` either succeeds or returns `LockError::Busy` at once.
//! Nothing here waits, polls or backs off. Once a connection is inside a
//! transaction a refused escalation is terminal for that step; retrying is
//! the runner's decision and only happens as a fresh top-level attempt after
//! a full release.

use crate::file_lock::FileLockState;
use crate::table_lock::{TableLock, TableLocks};
use lockstep_core::{ConnectionId, DatabaseName, LockLevel, LockResult, TableLockMode};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Point-in-time copy of a lock manager's state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Strongest lock outstanding
    pub state: LockLevel,
    /// Connections at SHARED or above
    pub shared: BTreeSet<ConnectionId>,
    /// RESERVED holder
    pub reserved: Option<ConnectionId>,
    /// PENDING holder
    pub pending: Option<ConnectionId>,
    /// EXCLUSIVE holder
    pub exclusive: Option<ConnectionId>,
    /// Shared-cache table locks
    pub tables: BTreeMap<String, TableLock>,
}

impl LockSnapshot {
    fn capture(file: &FileLockState, tables: &TableLocks) -> Self {
        Self {
            state: file.state(),
            shared: file.shared_holders().clone(),
            reserved: file.reserved_holder(),
            pending: file.pending_holder(),
            exclusive: file.exclusive_holder(),
            tables: tables.tables().clone(),
        }
    }

    /// Level held by one connection at this instant
    pub fn level_of(&self, conn: ConnectionId) -> LockLevel {
        if self.exclusive == Some(conn) {
            LockLevel::Exclusive
        } else if self.pending == Some(conn) {
            LockLevel::Pending
        } else if self.reserved == Some(conn) {
            LockLevel::Reserved
        } else if self.shared.contains(&conn) {
            LockLevel::Shared
        } else {
            LockLevel::Unlocked
        }
    }

    /// True if no file or table lock is held
    pub fn is_unlocked(&self) -> bool {
        self.state == LockLevel::Unlocked && self.tables.is_empty()
    }

    /// Every connection holding a file or table lock
    pub fn holders(&self) -> BTreeSet<ConnectionId> {
        let mut holders = self.shared.clone();
        for lock in self.tables.values() {
            holders.extend(lock.readers.iter().copied());
            holders.extend(lock.writer);
        }
        holders
    }

    /// Check every coexistence rule against this snapshot
    pub fn validate(&self) -> Result<(), String> {
        let strongest = if self.exclusive.is_some() {
            LockLevel::Exclusive
        } else if self.pending.is_some() {
            LockLevel::Pending
        } else if self.reserved.is_some() {
            LockLevel::Reserved
        } else if !self.shared.is_empty() {
            LockLevel::Shared
        } else {
            LockLevel::Unlocked
        };
        if strongest != self.state {
            return Err(format!(
                "state {} does not match strongest lock {}",
                self.state, strongest
            ));
        }
        if let (Some(r), Some(p)) = (self.reserved, self.pending) {
            if r != p {
                return Err(format!("RESERVED held by {} while PENDING held by {}", r, p));
            }
        }
        if let Some(x) = self.exclusive {
            if let Some(reader) = self.shared.iter().find(|c| **c != x) {
                return Err(format!(
                    "EXCLUSIVE held by {} while {} still holds SHARED",
                    x, reader
                ));
            }
            if self.reserved.is_some_and(|r| r != x) || self.pending.is_some_and(|p| p != x) {
                return Err(format!("EXCLUSIVE held by {} alongside another writer", x));
            }
        }
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

#[derive(Debug, Default)]
struct LockTable {
    file: FileLockState,
    tables: TableLocks,
}

/// Owns the lock state of one simulated database
///
/// Shared by `Arc` between every connection opened on the database. All
/// methods take `&self` and serialize on one internal mutex.
#[derive(Debug)]
pub struct LockManager {
    name: DatabaseName,
    inner: Mutex<LockTable>,
}

impl LockManager {
    /// Create an unlocked lock manager
    pub fn new(name: DatabaseName) -> Self {
        Self {
            name,
            inner: Mutex::new(LockTable::default()),
        }
    }

    /// Database this lock manager belongs to
    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    /// Enter the critical section
    ///
    /// Every call made through the session, and anything recorded while it
    /// is alive, is ordered as one unit against all other lock calls on this
    /// database. Do not call back into the `LockManager` while holding it.
    pub fn session(&self) -> LockSession<'_> {
        LockSession {
            name: &self.name,
            table: self.inner.lock(),
        }
    }

    /// Acquire SHARED
    ///
    /// Refused while another connection holds PENDING or EXCLUSIVE.
    pub fn acquire_shared(&self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.session().acquire_shared(conn)
    }

    /// Acquire RESERVED
    ///
    /// At most one holder. Of two readers racing for it, the first through
    /// the mutex wins and the other is refused immediately.
    pub fn acquire_reserved(&self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.session().acquire_reserved(conn)
    }

    /// Acquire PENDING; requires RESERVED
    pub fn acquire_pending(&self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.session().acquire_pending(conn)
    }

    /// Acquire EXCLUSIVE; requires PENDING and no other reader
    ///
    /// A refusal is final for the calling step: no internal retry.
    pub fn acquire_exclusive(&self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.session().acquire_exclusive(conn)
    }

    /// Lower a connection's file lock to `level`. Never fails.
    pub fn downgrade(&self, conn: ConnectionId, level: LockLevel) -> LockLevel {
        self.session().downgrade(conn, level)
    }

    /// Release every file and table lock held by `conn`
    ///
    /// Idempotent: releasing what is not held is a no-op.
    pub fn release(&self, conn: ConnectionId) {
        self.session().release(conn)
    }

    /// Acquire a shared-cache table lock
    pub fn acquire_table_lock(
        &self,
        conn: ConnectionId,
        table_name: &str,
        mode: TableLockMode,
    ) -> LockResult<TableLockMode> {
        self.session().acquire_table_lock(conn, table_name, mode)
    }

    /// Drop every table lock held by `conn`, leaving its file lock alone
    pub fn release_table_locks(&self, conn: ConnectionId) {
        self.session().release_table_locks(conn)
    }

    /// Strongest lock currently outstanding
    pub fn state(&self) -> LockLevel {
        self.session().state()
    }

    /// File lock held by one connection
    pub fn level_of(&self, conn: ConnectionId) -> LockLevel {
        self.session().level_of(conn)
    }

    /// Table lock held by one connection
    pub fn table_mode_of(&self, conn: ConnectionId, table_name: &str) -> Option<TableLockMode> {
        self.session().table_mode_of(conn, table_name)
    }

    /// Copy of the full lock state
    pub fn snapshot(&self) -> LockSnapshot {
        self.session().snapshot()
    }

    /// Forget all locks
    pub fn reset(&self) {
        let mut table = self.inner.lock();
        *table = LockTable::default();
        debug!(db = %self.name, "lock manager reset");
    }
}

/// Exclusive hold on a lock manager's critical section
///
/// Obtained from `LockManager::session`; the mutex is released on drop.
#[derive(Debug)]
pub struct LockSession<'a> {
    name: &'a DatabaseName,
    table: MutexGuard<'a, LockTable>,
}

impl LockSession<'_> {
    /// Database whose lock manager is held
    pub fn database(&self) -> &DatabaseName {
        self.name
    }

    fn transition(
        &mut self,
        conn: ConnectionId,
        requested: LockLevel,
        op: impl FnOnce(&mut FileLockState) -> LockResult<LockLevel>,
    ) -> LockResult<LockLevel> {
        let result = op(&mut self.table.file);
        match &result {
            Ok(held) => debug!(
                db = %self.name,
                %conn,
                %requested,
                %held,
                state = %self.table.file.state(),
                "lock granted"
            ),
            Err(e) => debug!(
                db = %self.name,
                %conn,
                %requested,
                state = %self.table.file.state(),
                error = %e,
                "lock refused"
            ),
        }
        debug_assert!(self.table.file.validate().is_ok());
        result
    }

    /// Acquire SHARED
    pub fn acquire_shared(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.transition(conn, LockLevel::Shared, |file| file.acquire_shared(conn))
    }

    /// Acquire RESERVED
    pub fn acquire_reserved(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.transition(conn, LockLevel::Reserved, |file| file.acquire_reserved(conn))
    }

    /// Acquire PENDING
    pub fn acquire_pending(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.transition(conn, LockLevel::Pending, |file| file.acquire_pending(conn))
    }

    /// Acquire EXCLUSIVE
    pub fn acquire_exclusive(&mut self, conn: ConnectionId) -> LockResult<LockLevel> {
        self.transition(conn, LockLevel::Exclusive, |file| file.acquire_exclusive(conn))
    }

    /// Lower a connection's file lock to `level`
    pub fn downgrade(&mut self, conn: ConnectionId, level: LockLevel) -> LockLevel {
        let held = self.table.file.downgrade(conn, level);
        debug!(db = %self.name, %conn, %held, state = %self.table.file.state(), "lock downgraded");
        held
    }

    /// Release every file and table lock held by `conn`
    pub fn release(&mut self, conn: ConnectionId) {
        self.table.file.release(conn);
        self.table.tables.release(conn);
        debug!(db = %self.name, %conn, state = %self.table.file.state(), "locks released");
    }

    /// Acquire a shared-cache table lock
    pub fn acquire_table_lock(
        &mut self,
        conn: ConnectionId,
        table_name: &str,
        mode: TableLockMode,
    ) -> LockResult<TableLockMode> {
        let result = self.table.tables.acquire(conn, table_name, mode);
        match &result {
            Ok(held) => debug!(db = %self.name, %conn, table = table_name, %held, "table lock granted"),
            Err(e) => debug!(db = %self.name, %conn, table = table_name, error = %e, "table lock refused"),
        }
        result
    }

    /// Drop every table lock held by `conn`
    pub fn release_table_locks(&mut self, conn: ConnectionId) {
        self.table.tables.release(conn);
    }

    /// Strongest lock currently outstanding
    pub fn state(&self) -> LockLevel {
        self.table.file.state()
    }

    /// File lock held by one connection
    pub fn level_of(&self, conn: ConnectionId) -> LockLevel {
        self.table.file.level_of(conn)
    }

    /// Table lock held by one connection
    pub fn table_mode_of(&self, conn: ConnectionId, table_name: &str) -> Option<TableLockMode> {
        self.table.tables.mode_of(conn, table_name)
    }

    /// Copy of the full lock state
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot::capture(&self.table.file, &self.table.tables)
    }
}
