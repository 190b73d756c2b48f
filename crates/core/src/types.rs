//! Core types for the lock simulator
//!
//! This module defines the shared vocabulary:
//! - LockLevel: the five-state file lock ladder
//! - ConnectionId: identity of a simulated connection within a run
//! - DatabaseName: identity of a simulated database (connections that name the
//!   same database contend on the same lock manager)
//! - TransactionMode: BEGIN DEFERRED / IMMEDIATE / EXCLUSIVE
//! - TableLockMode, CacheMode: shared-cache table locking

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// File-level lock held on a database
///
/// Ordered by severity: `Unlocked < Shared < Reserved < Pending < Exclusive`.
/// Levels are cumulative: a connection at `Reserved` also counts as a
/// shared reader.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockLevel {
    /// No lock held.
    #[default]
    Unlocked = 0,
    /// Reading. Any number of connections may hold it.
    Shared = 1,
    /// Intends to write. Coexists with readers, at most one holder.
    Reserved = 2,
    /// Waiting for readers to drain. Blocks new readers, at most one holder.
    Pending = 3,
    /// Writing. Excludes every other lock.
    Exclusive = 4,
}

impl LockLevel {
    /// All levels in ascending severity
    pub const ALL: [LockLevel; 5] = [
        LockLevel::Unlocked,
        LockLevel::Shared,
        LockLevel::Reserved,
        LockLevel::Pending,
        LockLevel::Exclusive,
    ];

    /// Upper-case name as used by the engine's documentation
    pub fn as_str(&self) -> &'static str {
        match self {
            LockLevel::Unlocked => "UNLOCKED",
            LockLevel::Shared => "SHARED",
            LockLevel::Reserved => "RESERVED",
            LockLevel::Pending => "PENDING",
            LockLevel::Exclusive => "EXCLUSIVE",
        }
    }

    /// True for RESERVED and PENDING, the writer-intent states
    pub fn is_writer_intent(&self) -> bool {
        matches!(self, LockLevel::Reserved | LockLevel::Pending)
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a simulated connection, unique within one run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Create a connection id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw numeric id
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Name of a simulated database
///
/// Two connections opened against the same name share one lock manager,
/// exactly as two handles on the same file (or the same named in-memory
/// database) share the engine's lock state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Name used when a scenario does not specify one
    pub const DEFAULT: &'static str = "main";

    /// Create a database name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A fresh, never-before-used name (UUID v4)
    ///
    /// Mirrors opening `file:<uuid>?mode=memory&cache=shared` so that every
    /// demonstration starts from a clean database.
    pub fn ephemeral() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DatabaseName {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locking behaviour of `BEGIN`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// No lock until the first read or write.
    #[default]
    Deferred,
    /// RESERVED immediately.
    Immediate,
    /// EXCLUSIVE immediately.
    Exclusive,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::Deferred => f.write_str("DEFERRED"),
            TransactionMode::Immediate => f.write_str("IMMEDIATE"),
            TransactionMode::Exclusive => f.write_str("EXCLUSIVE"),
        }
    }
}

/// Mode of a shared-cache table lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableLockMode {
    /// Table read lock; any number of holders.
    Read,
    /// Table write lock; excludes other readers and writers of the table.
    Write,
}

impl fmt::Display for TableLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLockMode::Read => f.write_str("read"),
            TableLockMode::Write => f.write_str("write"),
        }
    }
}

/// Page cache mode of a connection
///
/// Under `Shared`, statements additionally take table-level locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Private page cache (the engine default).
    #[default]
    Private,
    /// Shared cache; adds table-level locks.
    Shared,
}
