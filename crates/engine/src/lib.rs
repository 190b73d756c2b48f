//! Contention harness for lockstep
//!
//! This crate drives simulated connections against the lock layer:
//! - Step / RetryPolicy: the scripted statement language
//! - TransactionRunner: one connection's script on one thread
//! - ConnectionPool / PooledWorker: bounded checkout, rollback on checkin
//! - ContentionScheduler: runs a scenario, applies the run timeout
//! - Timeline / RunReport: totally ordered record of a run and its verdict
//! - ScenarioCatalog: built-in and directory-loaded scenarios
//! - LockstepConfig: `lockstep.toml`
//!
//! The scheduler never releases a lock on a connection's behalf. A run that
//! ends with locks held is reported as permanently locked; only
//! `ScenarioRun::teardown` clears it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod pool;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod script;
pub mod timeline;

pub use cancel::CancelToken;
pub use config::{LockstepConfig, CONFIG_FILE_NAME};
pub use pool::{ConnectionPool, PooledWorker};
pub use report::{
    ConnectionReport, DatabaseReport, DatabaseVerdict, RunReport, TerminalStatus, VerdictKind,
};
pub use runner::{RunnerState, RunnerSummary, TransactionRunner};
pub use scenario::{ConnectionSpec, Expectations, PoolSpec, Scenario, ScenarioCatalog};
pub use scheduler::{ContentionScheduler, ScenarioRun};
pub use script::{FailurePolicy, RetryPolicy, RetrySetting, Step, DEFAULT_TABLE};
pub use timeline::{BusyScope, Outcome, Record, Timeline, TimelineEntry};
