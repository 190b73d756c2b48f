//! Core types for lockstep
//!
//! This crate defines the vocabulary shared by every layer of the simulator:
//! - LockLevel: UNLOCKED / SHARED / RESERVED / PENDING / EXCLUSIVE
//! - ConnectionId, DatabaseName: identities within a run
//! - TransactionMode, TableLockMode, CacheMode
//! - LockError / Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, LockError, LockResult, Result};
pub use types::{CacheMode, ConnectionId, DatabaseName, LockLevel, TableLockMode, TransactionMode};
