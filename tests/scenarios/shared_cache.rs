//! Shared-cache table locks

use crate::common::*;
use lockstep::{CacheMode, TransactionMode};

#[test]
fn table_read_locks_refuse_a_write() {
    let report = run_builtin("shared_cache_table_lock");

    let alice = report.entries_for("alice");
    let write = alice
        .iter()
        .find(|e| e.step == "WRITE users")
        .expect("alice writes");
    assert_eq!(write.outcome.busy_table(), Some("users"), "{}", render(&report));
    // Refused before the file lock moved
    assert_eq!(write.held, LockLevel::Shared);
    assert_eq!(write.resulting_state, LockLevel::Shared);

    let table = write.snapshot.tables.get("users").expect("users is locked");
    assert_eq!(table.readers.len(), 2);
    assert!(table.writer.is_none());

    let bob_commit = report.entries_for("bob").pop().unwrap();
    assert!(bob_commit.outcome.is_success());
    assert!(bob_commit.snapshot.tables.is_empty());
}

#[test]
fn table_locks_only_conflict_on_the_same_table() {
    let begin = Step::Begin {
        mode: TransactionMode::Deferred,
    };
    let scenario = Scenario::new(
        "distinct_tables",
        vec![
            ConnectionSpec::new(
                "alice",
                vec![
                    begin.clone(),
                    Step::Read {
                        table: "orders".to_string(),
                    },
                    Step::Sleep { ms: 150 },
                    Step::Commit,
                ],
            )
            .with_cache(CacheMode::Shared),
            ConnectionSpec::new(
                "bob",
                vec![
                    Step::Sleep { ms: 50 },
                    begin,
                    Step::write(),
                    Step::Sleep { ms: 150 },
                    Step::Commit,
                ],
            )
            .with_cache(CacheMode::Shared),
        ],
    );

    let run = run(&scenario);
    let report = run.report().clone();
    assert_report_sound(&report);

    let write = report
        .entries_for("bob")
        .into_iter()
        .find(|e| e.step == "WRITE users")
        .unwrap();
    assert!(write.outcome.is_success(), "{}", render(&report));
    let users = write.snapshot.tables.get("users").unwrap();
    assert_eq!(users.writer, Some(write.conn));
    assert_eq!(
        write.snapshot.tables.get("orders").map(|t| t.readers.len()),
        Some(1)
    );
    assert!(report.is_recoverable());
    assert_eq!(report.committed_rows(), 1);
    run.teardown();
}
