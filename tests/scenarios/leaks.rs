//! Locks that outlive their scripts, and what clears them

use crate::common::*;
use lockstep::{FailurePolicy, TransactionMode};

#[test]
fn abandoned_connection_keeps_reserved() {
    let report = run_builtin("shared_connection_leak");

    assert_eq!(
        steps_of(&report, "shared"),
        vec![
            "BEGIN DEFERRED",
            "WRITE users",
            "WRITE users",
            "BEGIN DEFERRED",
            "END"
        ]
    );
    let shared = report.entries_for("shared");
    assert!(matches!(shared[3].outcome, Outcome::Invalid { .. }));
    assert_eq!(shared[3].held, LockLevel::Reserved);

    let conn = report.connection("shared").unwrap();
    assert!(conn.summary.abandoned);
    assert!(conn.in_transaction);
    assert_eq!(conn.final_lock, LockLevel::Reserved);

    // Every retry of the worker is refused by the leaked RESERVED
    let worker = report.entries_for("worker");
    assert_eq!(worker.len(), 3);
    assert!(worker.iter().all(|e| e.outcome.is_busy()));
    assert_eq!(worker.last().unwrap().backoff_ms, None);
    assert!(!report.timed_out);
}

#[test]
fn leaked_lock_survives_until_teardown() {
    let scenario = builtin("shared_connection_leak");
    let run = run(&scenario);

    let db = DatabaseName::default();
    let before = run.snapshot(&db).unwrap();
    assert_eq!(before.state, LockLevel::Reserved);
    let leaked = run
        .connections()
        .iter()
        .find(|c| c.name() == "shared")
        .unwrap();
    assert_eq!(before.reserved, Some(leaked.id()));

    let after = run.teardown();
    assert!(after[&db].is_unlocked());
}

#[test]
fn nested_begin_leaves_locks_alone() {
    let report = run_builtin("double_begin");

    let alice = report.entries_for("alice");
    assert_eq!(alice.len(), 4);
    match &alice[2].outcome {
        Outcome::Invalid { reason } => assert!(!reason.is_empty()),
        other => panic!("nested BEGIN recorded as {}", other),
    }
    assert_eq!(alice[2].held, LockLevel::Shared);
    assert_eq!(alice[2].snapshot, alice[1].snapshot);
    assert_eq!(alice[3].step, "COMMIT");
    assert_eq!(alice[3].held, LockLevel::Unlocked);
}

#[test]
fn continue_policy_runs_past_failures() {
    let begin = Step::Begin {
        mode: TransactionMode::Deferred,
    };
    let scenario = Scenario::new(
        "continue_past_busy",
        vec![
            ConnectionSpec::new(
                "holder",
                vec![
                    Step::Begin {
                        mode: TransactionMode::Immediate,
                    },
                    Step::Sleep { ms: 200 },
                    Step::Rollback,
                ],
            ),
            ConnectionSpec::new(
                "worker",
                vec![
                    Step::Sleep { ms: 50 },
                    begin,
                    Step::write(),
                    Step::read(),
                    Step::Commit,
                ],
            )
            .with_failure_policy(FailurePolicy::Continue),
        ],
    );

    let run = run(&scenario);
    let report = run.report().clone();
    assert_report_sound(&report);

    assert_eq!(
        steps_of(&report, "worker"),
        vec!["BEGIN DEFERRED", "WRITE users", "READ users", "COMMIT"]
    );
    let worker = report.entries_for("worker");
    assert!(worker[1].outcome.is_busy());
    assert!(worker[2].outcome.is_success());
    assert_eq!(worker[2].held, LockLevel::Shared);

    let summary = &report.connection("worker").unwrap().summary;
    assert_eq!(summary.failed_steps, 1);
    assert_eq!(summary.steps_skipped, 0);
    assert!(report.is_recoverable());
    run.teardown();
}

#[test]
fn connections_on_different_databases_do_not_contend() {
    let writer = |name: &str, db: &str| {
        ConnectionSpec::new(
            name,
            vec![
                Step::Begin {
                    mode: TransactionMode::Exclusive,
                },
                Step::write(),
                Step::Sleep { ms: 100 },
                Step::Commit,
            ],
        )
        .on_database(DatabaseName::new(db))
    };
    let scenario = Scenario::new("two_files", vec![writer("a", "a.db"), writer("b", "b.db")]);

    let run = run(&scenario);
    let report = run.report().clone();
    assert_report_sound(&report);

    assert_eq!(report.databases.len(), 2);
    assert!(report.timeline.iter().all(|e| e.outcome.is_success()));
    assert_eq!(report.committed_rows(), 2);
    assert!(report
        .timeline
        .iter()
        .all(|e| e.snapshot.holders().len() <= 1));
    run.teardown();
}
