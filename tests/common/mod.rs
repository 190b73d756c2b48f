//! Shared test utilities for all integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::Duration;

pub use lockstep::{
    ConnectionSpec, ContentionScheduler, DatabaseName, LockLevel, LockstepConfig, Outcome,
    RunReport, Scenario, ScenarioCatalog, ScenarioRun, Step, TerminalStatus, TimelineEntry,
    VerdictKind,
};

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

// ============================================================================
// Scenarios
// ============================================================================

/// A built-in scenario by name; panics if it does not exist.
pub fn builtin(name: &str) -> Scenario {
    ScenarioCatalog::builtin()
        .expect("built-in catalog loads")
        .get(name)
        .unwrap_or_else(|| panic!("no built-in scenario named {}", name))
        .clone()
}

/// Run a scenario and keep its connections for inspection.
pub fn run(scenario: &Scenario) -> ScenarioRun {
    init_tracing();
    ContentionScheduler::default()
        .run(scenario)
        .expect("scenario runs")
}

/// Run a built-in scenario and check it against its own expectations.
///
/// Also checks every timeline snapshot and that teardown leaves every
/// database unlocked.
pub fn run_builtin(name: &str) -> RunReport {
    let scenario = builtin(name);
    let run = run(&scenario);
    let report = run.report().clone();
    assert_report_sound(&report);

    let mismatches = report.verify(&scenario.expect);
    assert!(
        mismatches.is_empty(),
        "{} diverged from its expectations:\n{}\n\ntimeline:\n{}",
        name,
        mismatches.join("\n"),
        render(&report)
    );

    for (db, snapshot) in run.teardown() {
        assert!(snapshot.is_unlocked(), "{} still locked after teardown", db);
    }
    report
}

/// Structural checks that hold for every run.
pub fn assert_report_sound(report: &RunReport) {
    if let Err(violation) = report.validate_timeline() {
        panic!("lock invariant broken: {}\n{}", violation, render(report));
    }
    for (i, entry) in report.timeline.iter().enumerate() {
        assert_eq!(entry.seq, i as u64, "timeline sequence has a gap");
        assert_eq!(
            entry.held,
            entry.snapshot.level_of(entry.conn),
            "held level disagrees with snapshot at #{}",
            entry.seq
        );
        assert_eq!(entry.resulting_state, entry.snapshot.state);
    }
    for conn in &report.connections {
        let holds = conn.final_lock != LockLevel::Unlocked;
        assert_eq!(
            conn.status == TerminalStatus::Locked,
            holds,
            "{} status {} disagrees with final lock {}",
            conn.name,
            conn.status,
            conn.final_lock
        );
    }
}

/// The timeline, one entry per line.
pub fn render(report: &RunReport) -> String {
    report
        .timeline
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Steps (by rendered text) of one connection, in order.
pub fn steps_of(report: &RunReport, name: &str) -> Vec<String> {
    report
        .entries_for(name)
        .into_iter()
        .map(|e| e.step.clone())
        .collect()
}

// ============================================================================
// Timeout helpers
// ============================================================================

/// Run a closure on a helper thread; `None` if it does not finish in time.
pub fn with_timeout<F, T>(timeout: Duration, f: F) -> Option<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    rx.recv_timeout(timeout).ok()
}
