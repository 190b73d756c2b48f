//! Deadlock avoidance and releasing commits

use crate::common::*;
use lockstep::{
    CacheMode, Connection, ConnectionId, DatabaseRegistry, Record, Timeline, TransactionMode,
};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn two_readers_one_writer_wins() {
    let report = run_builtin("two_reader_deadlock");

    let writes: Vec<&TimelineEntry> = report
        .timeline
        .iter()
        .filter(|e| e.step == "WRITE users")
        .collect();
    assert_eq!(writes.len(), 2, "{}", render(&report));

    let winner = writes
        .iter()
        .find(|e| e.outcome.is_success())
        .expect("one write succeeds");
    let loser = writes
        .iter()
        .find(|e| e.outcome == Outcome::DeadlockAvoided)
        .expect("one write is refused as a deadlock");
    assert_ne!(winner.name, loser.name);
    assert_eq!(winner.held, LockLevel::Reserved);
    assert_eq!(loser.held, LockLevel::Shared);

    // The loser skips its sleep and commits straight away, releasing SHARED
    let loser_steps = report.entries_for(&loser.name);
    let after = loser_steps
        .iter()
        .skip_while(|e| e.seq != loser.seq)
        .nth(1)
        .expect("loser commits after the refusal");
    assert_eq!(after.step, "COMMIT");
    assert!(after.outcome.is_success());
    assert_eq!(after.held, LockLevel::Unlocked);

    assert_eq!(
        report.connection(&winner.name).unwrap().status,
        TerminalStatus::Succeeded
    );
    assert_eq!(
        report.connection(&loser.name).unwrap().status,
        TerminalStatus::Failed
    );
    assert_eq!(
        report.connection(&loser.name).unwrap().summary.steps_skipped,
        1
    );
}

#[test]
fn winner_commit_reaches_exclusive_after_loser_releases() {
    let report = run_builtin("two_reader_deadlock");
    let commits: Vec<&TimelineEntry> = report
        .timeline
        .iter()
        .filter(|e| e.step == "COMMIT")
        .collect();
    assert_eq!(commits.len(), 2);
    // The loser's releasing commit comes first
    assert!(commits[0].seq < commits[1].seq);
    assert!(commits.iter().all(|e| e.outcome.is_success()));
    assert_eq!(commits[1].resulting_state, LockLevel::Unlocked);
    assert!(commits[1]
        .detail
        .as_deref()
        .unwrap_or_default()
        .contains("1 row(s) committed"));
}

#[test]
fn commit_after_failed_write_releases_shared() {
    let report = run_builtin("commit_in_finally");

    let worker = report.entries_for("worker");
    assert_eq!(
        steps_of(&report, "worker"),
        vec!["BEGIN DEFERRED", "WRITE users", "COMMIT"]
    );
    // Refused while the writer holds RESERVED; nothing was held before it
    assert!(worker[1].outcome.is_busy(), "{}", render(&report));
    assert_eq!(worker[1].held, LockLevel::Shared);
    assert_eq!(worker[2].held, LockLevel::Unlocked);
    assert!(worker[2].outcome.is_success());

    let writer = report.entries_for("writer");
    let commit = writer.last().unwrap();
    assert_eq!(commit.step, "COMMIT");
    assert!(commit.seq > worker[2].seq);
    assert_eq!(commit.resulting_state, LockLevel::Unlocked);
}

/// Two readers race for RESERVED from real threads. Whichever thread gets
/// there second, its refusal is stamped after the grant it lost to.
#[test]
fn refused_write_is_never_stamped_before_the_winning_write() {
    for _ in 0..200 {
        let db = DatabaseRegistry::new().open(&DatabaseName::ephemeral());
        let timeline = Arc::new(Timeline::new());
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (1..=2)
            .map(|n| {
                let mut conn = Connection::open(
                    ConnectionId::new(n),
                    format!("conn{}", n),
                    Arc::clone(&db),
                    CacheMode::Private,
                );
                let timeline = Arc::clone(&timeline);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    conn.begin(TransactionMode::Deferred).unwrap();
                    conn.read("users").unwrap();
                    barrier.wait();

                    let record =
                        Record::new(conn.id(), conn.name(), "WRITE users", Outcome::Success);
                    conn.write_with("users", |result, locks| {
                        let record = match &result {
                            Ok(()) => record,
                            Err(e) => Record {
                                outcome: Outcome::from_lock_error(e),
                                ..record
                            },
                        };
                        timeline.record_in(locks, record);
                    });
                    conn
                })
            })
            .collect();
        let mut conns: Vec<Connection> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let entries = timeline.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].outcome.is_success(), "{:?}", entries);
        assert_eq!(entries[0].held, LockLevel::Reserved);
        assert_eq!(entries[1].outcome, Outcome::DeadlockAvoided, "{:?}", entries);
        assert_eq!(entries[1].held, LockLevel::Shared);
        assert_eq!(entries[1].snapshot.reserved, Some(entries[0].conn));

        for conn in &mut conns {
            conn.rollback();
        }
        assert!(db.locks().snapshot().is_unlocked());
    }
}
