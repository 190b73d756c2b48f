//! Writers refused EXCLUSIVE by readers: backoff, starvation and stuck PENDING

use crate::common::*;
use lockstep::BusyScope;

#[test]
fn starved_writer_backs_off_exponentially() {
    let report = run_builtin("pending_starvation");

    let writes: Vec<&TimelineEntry> = report
        .entries_for("writer")
        .into_iter()
        .filter(|e| e.step == "WRITE users")
        .collect();
    assert_eq!(writes.len(), 5, "{}", render(&report));

    let attempts: Vec<Option<u32>> = writes.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    let backoff: Vec<Option<u64>> = writes.iter().map(|e| e.backoff_ms).collect();
    assert_eq!(backoff, vec![Some(20), Some(40), Some(80), Some(160), None]);

    for write in &writes {
        // Autocommit writes start unlocked, so each refusal is plain busy
        assert_eq!(
            write.outcome,
            Outcome::Busy {
                scope: BusyScope::File
            }
        );
        // Each failed attempt unwinds completely
        assert_eq!(write.held, LockLevel::Unlocked);
        assert_eq!(write.resulting_state, LockLevel::Shared);
    }

    let writer = report.connection("writer").unwrap();
    assert_eq!(writer.summary.retries, 4);
    assert_eq!(writer.final_lock, LockLevel::Unlocked);
}

#[test]
fn cancelled_reader_keeps_shared() {
    let report = run_builtin("pending_starvation");
    assert!(report.timed_out);

    let reader = report.connection("reader").unwrap();
    assert!(reader.summary.cancelled);
    assert!(reader.in_transaction);
    assert_eq!(reader.final_lock, LockLevel::Shared);

    assert_eq!(steps_of(&report, "reader"), vec!["BEGIN DEFERRED", "READ users", "END"]);
    let end = report.entries_for("reader").pop().unwrap();
    assert_eq!(end.outcome, Outcome::Locked);
    assert_eq!(end.held, LockLevel::Shared);
    assert_eq!(report.holders(), vec!["reader".to_string()]);
}

#[test]
fn backoff_succeeds_once_reader_commits() {
    let report = run_builtin("backoff_recovery");

    let writes: Vec<&TimelineEntry> = report.entries_for("writer");
    let (last, refused) = writes.split_last().unwrap();
    assert!(!refused.is_empty(), "{}", render(&report));
    assert!(refused.iter().all(|e| e.outcome.is_busy()));
    assert!(last.outcome.is_success());
    assert_eq!(last.attempt, Some(refused.len() as u32));
    assert_eq!(last.held, LockLevel::Unlocked);

    let reader_commit = report.entries_for("reader").pop().unwrap();
    assert_eq!(reader_commit.step, "COMMIT");
    assert!(reader_commit.seq < last.seq);
    assert!(refused.iter().all(|e| e.seq < reader_commit.seq));
}

#[test]
fn blocked_commit_stays_pending_and_fences_readers() {
    let report = run_builtin("stuck_pending");

    assert_eq!(
        steps_of(&report, "writer"),
        vec!["BEGIN DEFERRED", "WRITE users", "COMMIT", "END"]
    );
    let writer = report.entries_for("writer");
    assert!(writer[2].outcome.is_busy());
    assert_eq!(writer[2].held, LockLevel::Pending);
    assert_eq!(writer[3].outcome, Outcome::Locked);

    let late = report.entries_for("late_reader");
    assert_eq!(late.len(), 1);
    assert!(late[0].outcome.is_busy());
    assert_eq!(late[0].held, LockLevel::Unlocked);
    assert_eq!(late[0].resulting_state, LockLevel::Pending);

    // The original reader still commits; PENDING outlives it
    let reader_commit = report.entries_for("reader").pop().unwrap();
    assert_eq!(reader_commit.step, "COMMIT");
    assert!(reader_commit.outcome.is_success());
    assert!(reader_commit.seq > late[0].seq);

    let db = report.database(&DatabaseName::default()).unwrap();
    assert_eq!(db.snapshot.pending, Some(writer[0].conn));
    assert!(db.snapshot.shared.contains(&writer[0].conn));
    assert_eq!(db.snapshot.shared.len(), 1);
}
