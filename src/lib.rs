//! lockstep - deterministic lock-contention simulator
//!
//! lockstep reproduces, step by step, the file-lock transitions of a
//! single-writer/multi-reader embedded database (SQLite's rollback-journal
//! locking) under concurrent access, and shows how independent connections
//! that interleave reads and writes end in "database is locked".
//!
//! # Quick Start
//!
//! ```no_run
//! use lockstep::{ContentionScheduler, ScenarioCatalog};
//!
//! let catalog = ScenarioCatalog::builtin()?;
//! let scenario = catalog.get("two_reader_deadlock").expect("built-in scenario");
//! let report = ContentionScheduler::default().simulate(scenario)?;
//! println!("{}", report.summary());
//! for entry in &report.timeline {
//!     println!("{}", entry);
//! }
//! # Ok::<(), lockstep::Error>(())
//! ```
//!
//! # Architecture
//!
//! - `lockstep-core`: lock levels, identities, errors
//! - `lockstep-concurrency`: lock manager, simulated databases and connections
//! - `lockstep-engine`: runners, scheduler, timeline, reports, scenarios, config
//!
//! This crate re-exports all three.

pub use lockstep_concurrency::{
    CommitStatus, Connection, Database, DatabaseRegistry, LockManager, LockSession, LockSnapshot,
};
pub use lockstep_core::{
    CacheMode, ConnectionId, DatabaseName, Error, LockError, LockLevel, LockResult, Result,
    TableLockMode, TransactionMode,
};
pub use lockstep_engine::*;
