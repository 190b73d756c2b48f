//! Run timeline
//!
//! Every lock-relevant step of every connection becomes one `TimelineEntry`.
//! Entries are appended while the step's own `LockSession` is still held:
//! the step's lock calls, its snapshot and its `seq` all come from one
//! critical section. `seq` order is therefore the order in which steps were
//! serialized on the lock manager, and each snapshot shows exactly the state
//! the step left behind.
//!
//! The timeline is append-only; entries are never modified once recorded.

use lockstep_concurrency::{LockManager, LockSession, LockSnapshot};
use lockstep_core::{ConnectionId, DatabaseName, LockError, LockLevel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Where a Busy refusal came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyScope {
    /// The database file lock
    File,
    /// A shared-cache table lock on the named table
    Table(String),
    /// Every connection of the named pool was checked out
    Pool(String),
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The step did what it asked
    Success,
    /// Refused because another connection holds a conflicting lock
    Busy {
        /// File or table
        scope: BusyScope,
    },
    /// Refused RESERVED while holding SHARED; waiting would have deadlocked
    DeadlockAvoided,
    /// The connection finished the run still holding locks
    Locked,
    /// Script error, such as a nested BEGIN
    Invalid {
        /// What was wrong
        reason: String,
    },
}

impl Outcome {
    /// Classify a lock error
    pub fn from_lock_error(err: &LockError) -> Self {
        match err {
            LockError::Busy { deadlock: true, .. } => Outcome::DeadlockAvoided,
            LockError::Busy { .. } => Outcome::Busy {
                scope: BusyScope::File,
            },
            LockError::TableLocked { table, .. } => Outcome::Busy {
                scope: BusyScope::Table(table.clone()),
            },
            LockError::InvalidTransition { .. } => Outcome::Invalid {
                reason: err.to_string(),
            },
        }
    }

    /// True for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// True for any contention refusal, deadlock-avoiding ones included
    pub fn is_busy(&self) -> bool {
        matches!(self, Outcome::Busy { .. } | Outcome::DeadlockAvoided)
    }

    /// Table named by a table-scoped Busy
    pub fn busy_table(&self) -> Option<&str> {
        match self {
            Outcome::Busy {
                scope: BusyScope::Table(table),
            } => Some(table),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("ok"),
            Outcome::Busy {
                scope: BusyScope::File,
            } => f.write_str("busy"),
            Outcome::Busy {
                scope: BusyScope::Table(table),
            } => write!(f, "busy (table {})", table),
            Outcome::Busy {
                scope: BusyScope::Pool(pool),
            } => write!(f, "busy (pool {})", pool),
            Outcome::DeadlockAvoided => f.write_str("busy (deadlock avoided)"),
            Outcome::Locked => f.write_str("locked"),
            Outcome::Invalid { reason } => write!(f, "invalid: {}", reason),
        }
    }
}

/// One recorded step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Position in the timeline, from 0
    pub seq: u64,
    /// Microseconds since the run started
    pub elapsed_us: u64,
    /// Connection that ran the step
    pub conn: ConnectionId,
    /// Its scenario name
    pub name: String,
    /// Database the step ran against
    pub database: DatabaseName,
    /// The step, e.g. `WRITE users`
    pub step: String,
    /// What happened
    pub outcome: Outcome,
    /// Strongest lock outstanding on the database afterwards
    pub resulting_state: LockLevel,
    /// Lock the connection holds afterwards
    pub held: LockLevel,
    /// Attempt number for retried writes, from 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Backoff before the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    /// Full lock state afterwards
    pub snapshot: LockSnapshot,
    /// Free-form detail, e.g. the error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl fmt::Display for TimelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:<3} {:>8.1}ms  {:<12} {:<16} {:<28} held={:<9} state={}",
            self.seq,
            self.elapsed_us as f64 / 1000.0,
            self.name,
            self.step,
            self.outcome.to_string(),
            self.held.as_str(),
            self.resulting_state
        )?;
        if let (Some(attempt), Some(backoff)) = (self.attempt, self.backoff_ms) {
            write!(f, " (attempt {}, backoff {}ms)", attempt, backoff)?;
        }
        Ok(())
    }
}

/// What a runner reports about a step; the timeline fills in the rest
#[derive(Debug, Clone)]
pub struct Record {
    /// Connection that ran the step
    pub conn: ConnectionId,
    /// Its scenario name
    pub name: String,
    /// The step
    pub step: String,
    /// What happened
    pub outcome: Outcome,
    /// Attempt number for retried writes
    pub attempt: Option<u32>,
    /// Backoff before the next attempt
    pub backoff_ms: Option<u64>,
    /// Free-form detail
    pub detail: Option<String>,
}

impl Record {
    /// A record with no retry information or detail
    pub fn new(
        conn: ConnectionId,
        name: impl Into<String>,
        step: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            conn,
            name: name.into(),
            step: step.into(),
            outcome,
            attempt: None,
            backoff_ms: None,
            detail: None,
        }
    }

    /// Attach retry information
    pub fn with_attempt(mut self, attempt: u32, backoff_ms: Option<u64>) -> Self {
        self.attempt = Some(attempt);
        self.backoff_ms = backoff_ms;
        self
    }

    /// Attach detail
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Append-only, totally ordered log of one run
#[derive(Debug)]
pub struct Timeline {
    started: Instant,
    entries: Mutex<Vec<TimelineEntry>>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// Start an empty timeline; elapsed times are measured from now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append an entry stamped under a fresh session on `locks`
    ///
    /// For entries that are not the result of a connection statement (run
    /// annotations, teardown). Returns the entry's `seq`.
    pub fn record(&self, locks: &LockManager, record: Record) -> u64 {
        self.record_in(&locks.session(), record)
    }

    /// Append an entry stamped inside an already held session
    ///
    /// Called from a connection's statement closure, so nothing can reach the
    /// lock manager between the statement and its entry. Returns the entry's
    /// `seq`.
    pub fn record_in(&self, locks: &LockSession<'_>, record: Record) -> u64 {
        let snapshot = locks.snapshot();
        let mut entries = self.entries.lock();
        let seq = entries.len() as u64;
        entries.push(TimelineEntry {
            seq,
            elapsed_us: self.started.elapsed().as_micros() as u64,
            conn: record.conn,
            name: record.name,
            database: locks.database().clone(),
            step: record.step,
            outcome: record.outcome,
            resulting_state: snapshot.state,
            held: snapshot.level_of(record.conn),
            attempt: record.attempt,
            backoff_ms: record.backoff_ms,
            snapshot,
            detail: record.detail,
        });
        seq
    }

    /// Copy of every entry, in order
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.lock().clone()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Entries of one connection, in order
    pub fn for_conn(&self, conn: ConnectionId) -> Vec<TimelineEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.conn == conn)
            .cloned()
            .collect()
    }
}
