//! Scenario Integration Tests
//!
//! Runs the built-in contention scenarios end to end through the scheduler
//! and checks their timelines, verdicts and teardown.

#[path = "../common/mod.rs"]
mod common;

mod builtin;
mod deadlock;
mod invariants;
mod leaks;
mod pool;
mod shared_cache;
mod starvation;
