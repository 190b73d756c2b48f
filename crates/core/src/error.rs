//! Error types for the lock simulator
//!
//! Two layers, both built with `thiserror`:
//! - `LockError`: typed refusals returned by the lock manager. These are
//!   ordinary results, never panics, and are turned into timeline outcomes
//!   by the runner.
//! - `Error`: everything else (script errors, scenario/config loading).

use crate::types::{ConnectionId, LockLevel, TableLockMode};
use std::io;
use thiserror::Error;

/// Result type alias for lock manager operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type alias for everything above the lock manager
pub type Result<T> = std::result::Result<T, Error>;

/// A lock request the lock manager refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// File-level contention, returned immediately
    #[error("database is locked: {conn} cannot acquire {requested}{}", holder_suffix(.holder))]
    Busy {
        /// Connection that asked
        conn: ConnectionId,
        /// Level it asked for
        requested: LockLevel,
        /// Connection whose lock caused the refusal, if a single one did
        holder: Option<ConnectionId>,
        /// Whether a busy handler could have retried this call in place.
        /// False once the requester is inside a transaction.
        retriable: bool,
        /// Waiting would deadlock: the requester holds SHARED and the
        /// blocker needs it gone before it can reach EXCLUSIVE.
        deadlock: bool,
    },

    /// Shared-cache table contention, returned immediately
    #[error("database table is locked: {table} ({conn} wants {mode}, held by {holder})")]
    TableLocked {
        /// Connection that asked
        conn: ConnectionId,
        /// Table name
        table: String,
        /// Mode it asked for
        mode: TableLockMode,
        /// A connection holding a conflicting table lock
        holder: ConnectionId,
    },

    /// The request skips a rung of the lock ladder
    #[error("invalid lock transition for {conn}: {from} -> {to}")]
    InvalidTransition {
        /// Connection that asked
        conn: ConnectionId,
        /// Level it held
        from: LockLevel,
        /// Level it asked for
        to: LockLevel,
    },
}

fn holder_suffix(holder: &Option<ConnectionId>) -> String {
    match holder {
        Some(h) => format!(" (held by {})", h),
        None => String::new(),
    }
}

impl LockError {
    /// True for file-level or table-level contention
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. } | LockError::TableLocked { .. })
    }

    /// True if the refusal breaks a would-be deadlock
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::Busy { deadlock: true, .. })
    }

    /// Table the contention is scoped to, for table-level refusals
    pub fn table(&self) -> Option<&str> {
        match self {
            LockError::TableLocked { table, .. } => Some(table),
            _ => None,
        }
    }
}

/// Error types above the lock manager
#[derive(Debug, Error)]
pub enum Error {
    /// A lock request was refused
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A connection was driven through an illegal transaction transition
    /// (e.g. nested BEGIN)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A scenario definition is malformed
    #[error("Scenario error: {0}")]
    Scenario(String),

    /// Every pooled connection stayed checked out for the whole checkout
    /// timeout
    #[error("pool {pool} limit of {size} reached, checkout timed out after {waited_ms}ms")]
    PoolTimeout {
        /// Pool name
        pool: String,
        /// Connections in the pool
        size: usize,
        /// How long the checkout waited
        waited_ms: u64,
    },

    /// The pool was closed while a checkout waited
    #[error("pool {0} is closed")]
    PoolClosed(String),

    /// Configuration could not be read or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error (scenario and config files)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Creates an invalid transition error.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Error::InvalidTransition(message.into())
    }

    /// Creates a scenario error.
    pub fn scenario(message: impl Into<String>) -> Self {
        Error::Scenario(message.into())
    }

    /// Creates a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// The lock refusal behind this error, if any
    pub fn as_lock_error(&self) -> Option<&LockError> {
        match self {
            Error::Lock(e) => Some(e),
            _ => None,
        }
    }
}
