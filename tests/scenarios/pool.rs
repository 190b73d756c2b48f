//! Connection pool exhaustion and reset on checkin

use crate::common::*;
use lockstep::{BusyScope, ConnectionId, PoolSpec};
use std::collections::BTreeMap;

#[test]
fn pool_stress_stays_recoverable() {
    let report = run_builtin("pool_stress");
    assert!(report.is_recoverable(), "{}", render(&report));

    // Four workers on two connections: some checkouts must have timed out
    let exhausted = Outcome::Busy {
        scope: BusyScope::Pool("app".to_string()),
    };
    assert!(
        report.timeline.iter().any(|e| e.outcome == exhausted),
        "no checkout timed out:\n{}",
        render(&report)
    );

    // Every borrowed connection came back and was reset
    let checkouts = report
        .timeline
        .iter()
        .filter(|e| e.step == "CHECKOUT app" && e.outcome.is_success())
        .count();
    let checkins: Vec<&TimelineEntry> = report
        .timeline
        .iter()
        .filter(|e| e.step == "CHECKIN app")
        .collect();
    assert!(checkouts > 0);
    assert_eq!(checkouts, checkins.len());
    assert!(checkins.iter().all(|e| e.held == LockLevel::Unlocked));

    for conn in &report.connections {
        assert_eq!(conn.final_lock, LockLevel::Unlocked, "{}", conn.name);
        assert_ne!(conn.status, TerminalStatus::Locked, "{}", conn.name);
        assert!(conn.summary.steps_run > 0, "{}", conn.name);
    }
}

#[test]
fn each_pass_stays_on_its_checked_out_connection() {
    let report = run_builtin("pool_stress");

    for worker in ["primary", "worker1", "worker2", "worker3"] {
        let mut current: Option<ConnectionId> = None;
        for entry in report.entries_for(worker) {
            match entry.step.as_str() {
                "CHECKOUT app" if entry.outcome.is_success() => {
                    assert!(current.is_none(), "{} checked out twice", worker);
                    current = Some(entry.conn);
                }
                "CHECKOUT app" => assert!(current.is_none()),
                "CHECKIN app" => {
                    assert_eq!(current, Some(entry.conn), "{} returned another connection", worker);
                    current = None;
                }
                _ => assert_eq!(current, Some(entry.conn), "{}: {}", worker, entry),
            }
        }
        assert!(current.is_none(), "{} kept a connection", worker);
    }
}

#[test]
fn checkout_waits_for_a_returned_connection() {
    // One connection, a generous timeout: the second worker waits, never fails
    let pass = vec![
        Step::Begin {
            mode: lockstep::TransactionMode::Immediate,
        },
        Step::write(),
        Step::Sleep { ms: 20 },
        Step::Commit,
    ];
    let scenario = Scenario::new(
        "patient_pool",
        vec![
            ConnectionSpec::new("a", pass.clone()).from_pool("app", 2),
            ConnectionSpec::new("b", pass).from_pool("app", 2),
        ],
    )
    .with_pool("app", PoolSpec::new(1).with_checkout_timeout_ms(2_000));

    let run = run(&scenario);
    let report = run.report().clone();
    assert_report_sound(&report);

    assert!(report.is_recoverable());
    assert_eq!(report.committed_rows(), 4);
    let statuses: BTreeMap<&str, TerminalStatus> = report
        .connections
        .iter()
        .map(|c| (c.name.as_str(), c.status))
        .collect();
    assert_eq!(statuses["a"], TerminalStatus::Succeeded);
    assert_eq!(statuses["b"], TerminalStatus::Succeeded);
    assert!(run.teardown().values().all(|s| s.is_unlocked()));
}
