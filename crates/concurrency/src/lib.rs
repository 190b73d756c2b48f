//! Lock layer for lockstep
//!
//! This crate implements the SQLite lock protocol as a deterministic state
//! machine:
//! - FileLockState: the five-level file lock ladder of one database
//! - TableLocks: shared-cache table read/write locks
//! - LockManager: both automata behind one mutex, the serialization point
//! - Database / DatabaseRegistry: named databases of one run
//! - Connection: statement-level intents translated into lock calls
//!
//! Every acquire succeeds or fails at once. Nothing in this crate sleeps,
//! polls, or retries.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod database;
pub mod file_lock;
pub mod lock_manager;
pub mod table_lock;

pub use connection::{CommitStatus, Connection};
pub use database::{Database, DatabaseRegistry};
pub use file_lock::FileLockState;
pub use lock_manager::{LockManager, LockSession, LockSnapshot};
pub use table_lock::{TableLock, TableLocks};
