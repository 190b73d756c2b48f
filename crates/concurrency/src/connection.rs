//! Simulated connections
//!
//! A `Connection` is one logical client of a database. It translates
//! statement-level intents (BEGIN, a read, a write, COMMIT) into lock manager
//! calls the way the engine's pager does, and caches the lock level it last
//! obtained.
//!
//! ## Transaction state
//!
//! ```text
//! autocommit --begin()--> explicit --commit()/rollback()--> autocommit
//! ```
//!
//! Outside an explicit transaction every statement is its own transaction:
//! its locks are released when it ends, successful or not. Inside one, locks
//! accumulate until `commit()` or `rollback()`.
//!
//! Dropping a connection does not release its locks. A connection whose
//! owner stopped before committing leaves its locks behind, which is the
//! failure this crate exists to show; teardown releases them explicitly.
//!
//! ## Atomic statements
//!
//! Each statement takes the database's `LockSession` once and makes every
//! lock call it needs under it. The `*_with` variants run a caller closure
//! on the outcome before that session is dropped, which is how the engine
//! stamps timeline entries in lock order.

use crate::database::Database;
use crate::lock_manager::LockSession;
use lockstep_core::{
    CacheMode, ConnectionId, Error, LockError, LockLevel, LockResult, Result, TableLockMode,
    TransactionMode,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Outcome of `Connection::commit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// Transaction ended and every lock was released
    Committed {
        /// Rows made durable by this commit
        rows: u64,
    },
    /// Nothing was open; any stray lock was still released
    NoTransaction,
    /// Escalation to EXCLUSIVE was refused. The connection keeps PENDING
    /// and its transaction stays open.
    Blocked(LockError),
}

impl CommitStatus {
    /// True unless the commit was blocked
    pub fn is_released(&self) -> bool {
        !matches!(self, CommitStatus::Blocked(_))
    }
}

/// One simulated connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    name: String,
    db: Arc<Database>,
    cache: CacheMode,
    held: LockLevel,
    in_transaction: bool,
    mode: TransactionMode,
    pending_rows: BTreeMap<String, u64>,
}

impl Connection {
    /// Open a connection on `db`
    pub fn open(
        id: ConnectionId,
        name: impl Into<String>,
        db: Arc<Database>,
        cache: CacheMode,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            db,
            cache,
            held: LockLevel::Unlocked,
            in_transaction: false,
            mode: TransactionMode::Deferred,
            pending_rows: BTreeMap::new(),
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database this connection is open on
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Page cache mode
    pub fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    /// Lock level this connection last obtained
    pub fn held_lock(&self) -> LockLevel {
        self.held
    }

    /// True inside BEGIN ... COMMIT
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Mode of the current (or last) explicit transaction
    pub fn transaction_mode(&self) -> TransactionMode {
        self.mode
    }

    /// Rows written but not yet committed
    pub fn uncommitted_rows(&self) -> u64 {
        self.pending_rows.values().sum()
    }

    /// Climb the lock ladder one rung at a time up to `target`
    ///
    /// Stops at the first refusal; `held` reflects the rungs that were
    /// granted.
    fn escalate_to(&mut self, locks: &mut LockSession<'_>, target: LockLevel) -> LockResult<()> {
        while self.held < target {
            let next = match self.held {
                LockLevel::Unlocked => locks.acquire_shared(self.id),
                LockLevel::Shared => locks.acquire_reserved(self.id),
                LockLevel::Reserved => locks.acquire_pending(self.id),
                LockLevel::Pending => locks.acquire_exclusive(self.id),
                LockLevel::Exclusive => break,
            };
            self.held = next?;
        }
        Ok(())
    }

    /// Give up locks above `level`
    fn unwind_to(&mut self, locks: &mut LockSession<'_>, level: LockLevel) {
        if level == LockLevel::Unlocked {
            self.release_all(locks);
        } else {
            self.held = locks.downgrade(self.id, level);
        }
    }

    fn release_all(&mut self, locks: &mut LockSession<'_>) {
        locks.release(self.id);
        self.held = LockLevel::Unlocked;
    }

    /// Escalate to EXCLUSIVE and make buffered rows durable
    fn write_back(&mut self, locks: &mut LockSession<'_>) -> LockResult<u64> {
        self.escalate_to(locks, LockLevel::Exclusive)?;
        let rows = self.db.apply_rows(locks, self.id, &self.pending_rows)?;
        self.pending_rows.clear();
        Ok(rows)
    }

    /// BEGIN a transaction
    ///
    /// DEFERRED takes no lock. IMMEDIATE takes RESERVED and EXCLUSIVE takes
    /// EXCLUSIVE right away; if that is refused the locks taken by this call
    /// are given back and no transaction is opened.
    ///
    /// # Errors
    ///
    /// `Error::InvalidTransition` if a transaction is already open (nested
    /// BEGIN); lock state is left untouched. `Error::Lock` if the lock
    /// required by the mode is refused.
    pub fn begin(&mut self, mode: TransactionMode) -> Result<()> {
        self.begin_with(mode, |result, _| result)
    }

    /// `begin`, handing the outcome to `f` before the lock manager is
    /// released
    ///
    /// No other connection's lock call can land between the statement and
    /// `f`, so whatever `f` records is ordered exactly as the statement was.
    pub fn begin_with<R>(
        &mut self,
        mode: TransactionMode,
        f: impl FnOnce(Result<()>, &LockSession<'_>) -> R,
    ) -> R {
        let db = Arc::clone(&self.db);
        let mut locks = db.locks().session();
        let result = self.begin_in(&mut locks, mode);
        f(result, &locks)
    }

    fn begin_in(&mut self, locks: &mut LockSession<'_>, mode: TransactionMode) -> Result<()> {
        if self.in_transaction {
            return Err(Error::invalid_transition(format!(
                "{} cannot BEGIN {}: a {} transaction is already active",
                self.id, mode, self.mode
            )));
        }

        let before = self.held;
        let target = match mode {
            TransactionMode::Deferred => LockLevel::Unlocked,
            TransactionMode::Immediate => LockLevel::Reserved,
            TransactionMode::Exclusive => LockLevel::Exclusive,
        };
        if let Err(e) = self.escalate_to(locks, target) {
            self.unwind_to(locks, before);
            return Err(e.into());
        }

        self.in_transaction = true;
        self.mode = mode;
        debug!(conn = %self.id, %mode, held = %self.held, "transaction started");
        Ok(())
    }

    /// Read `table`
    ///
    /// Takes SHARED, plus the table read lock under a shared cache. In
    /// autocommit mode the statement's locks are released when it ends.
    pub fn read(&mut self, table: &str) -> LockResult<()> {
        self.read_with(table, |result, _| result)
    }

    /// `read`, handing the outcome to `f` before the lock manager is released
    pub fn read_with<R>(
        &mut self,
        table: &str,
        f: impl FnOnce(LockResult<()>, &LockSession<'_>) -> R,
    ) -> R {
        let db = Arc::clone(&self.db);
        let mut locks = db.locks().session();
        let result = self.read_locks(&mut locks, table);
        if !self.in_transaction {
            self.release_all(&mut locks);
        }
        f(result, &locks)
    }

    fn read_locks(&mut self, locks: &mut LockSession<'_>, table: &str) -> LockResult<()> {
        self.escalate_to(locks, LockLevel::Shared)?;
        if self.cache == CacheMode::Shared {
            locks.acquire_table_lock(self.id, table, TableLockMode::Read)?;
        }
        Ok(())
    }

    /// Write one row to `table`
    ///
    /// Takes the table write lock under a shared cache (checked first, at
    /// statement execution), then SHARED and RESERVED. Inside a transaction
    /// the row is buffered until commit. In autocommit mode the statement
    /// commits on the spot (PENDING, EXCLUSIVE, write, release), and any
    /// refusal unwinds every lock before returning.
    pub fn write(&mut self, table: &str) -> LockResult<()> {
        self.write_with(table, |result, _| result)
    }

    /// `write`, handing the outcome to `f` before the lock manager is
    /// released
    pub fn write_with<R>(
        &mut self,
        table: &str,
        f: impl FnOnce(LockResult<()>, &LockSession<'_>) -> R,
    ) -> R {
        let db = Arc::clone(&self.db);
        let mut locks = db.locks().session();
        let result = self.write_in(&mut locks, table);
        f(result, &locks)
    }

    fn write_in(&mut self, locks: &mut LockSession<'_>, table: &str) -> LockResult<()> {
        let before = self.held;
        if let Err(e) = self
            .write_locks(locks, table)
            .map_err(|e| statement_error(before, e))
        {
            if !self.in_transaction {
                self.rollback_in(locks);
            }
            return Err(e);
        }
        *self.pending_rows.entry(table.to_string()).or_insert(0) += 1;

        if !self.in_transaction {
            let result = self.write_back(locks);
            self.rollback_in(locks);
            result?;
        }
        Ok(())
    }

    fn write_locks(&mut self, locks: &mut LockSession<'_>, table: &str) -> LockResult<()> {
        if self.cache == CacheMode::Shared {
            locks.acquire_table_lock(self.id, table, TableLockMode::Write)?;
        }
        self.escalate_to(locks, LockLevel::Reserved)
    }

    /// COMMIT
    ///
    /// Always attempts to release everything this connection holds, whether
    /// or not earlier statements failed, and never returns an error. The only
    /// case that does not release is a writer whose escalation to EXCLUSIVE
    /// is refused: it keeps PENDING with the transaction open, and a later
    /// `commit()` tries again. Safe to call any number of times.
    pub fn commit(&mut self) -> CommitStatus {
        self.commit_with(|status, _| status)
    }

    /// `commit`, handing the status to `f` before the lock manager is
    /// released
    pub fn commit_with<R>(&mut self, f: impl FnOnce(CommitStatus, &LockSession<'_>) -> R) -> R {
        let db = Arc::clone(&self.db);
        let mut locks = db.locks().session();
        let status = self.commit_in(&mut locks);
        f(status, &locks)
    }

    fn commit_in(&mut self, locks: &mut LockSession<'_>) -> CommitStatus {
        if !self.in_transaction {
            self.release_all(locks);
            return CommitStatus::NoTransaction;
        }

        let rows = if self.pending_rows.is_empty() {
            0
        } else {
            match self.write_back(locks) {
                Ok(rows) => rows,
                Err(e) => {
                    debug!(conn = %self.id, held = %self.held, error = %e, "commit blocked");
                    return CommitStatus::Blocked(e);
                }
            }
        };

        self.release_all(locks);
        self.in_transaction = false;
        debug!(conn = %self.id, rows, "transaction committed");
        CommitStatus::Committed { rows }
    }

    /// ROLLBACK: discard buffered rows and release every lock
    pub fn rollback(&mut self) {
        self.rollback_with(|_| ())
    }

    /// `rollback`, then `f` before the lock manager is released
    pub fn rollback_with<R>(&mut self, f: impl FnOnce(&LockSession<'_>) -> R) -> R {
        let db = Arc::clone(&self.db);
        let mut locks = db.locks().session();
        self.rollback_in(&mut locks);
        f(&locks)
    }

    fn rollback_in(&mut self, locks: &mut LockSession<'_>) {
        self.pending_rows.clear();
        self.release_all(locks);
        self.in_transaction = false;
    }

    /// Close the connection, rolling back anything open
    ///
    /// This is process-exit semantics: locks are cleared no matter what.
    pub fn close(&mut self) {
        if self.held != LockLevel::Unlocked || self.in_transaction {
            debug!(conn = %self.id, held = %self.held, "closing connection with open locks");
        }
        self.rollback();
    }
}

/// A statement that started with no lock took its SHARED itself, so a
/// refused RESERVED cannot deadlock with it: the busy handler may retry.
fn statement_error(before: LockLevel, err: LockError) -> LockError {
    match err {
        LockError::Busy {
            conn,
            requested,
            holder,
            deadlock: true,
            ..
        } if before == LockLevel::Unlocked => LockError::Busy {
            conn,
            requested,
            holder,
            retriable: true,
            deadlock: false,
        },
        other => other,
    }
}
