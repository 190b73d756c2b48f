//! Run report
//!
//! The hand-off to whatever presents a run: the full timeline, how each
//! connection ended, how each database ended, and the verdict that matters
//! most: could the database recover by itself, or is it locked until the
//! process restarts.

use crate::runner::RunnerSummary;
use crate::scenario::Expectations;
use crate::timeline::TimelineEntry;
use chrono::{DateTime, Utc};
use lockstep_concurrency::LockSnapshot;
use lockstep_core::{CacheMode, ConnectionId, DatabaseName, LockLevel, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How one connection finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    /// Every step succeeded and nothing is held
    Succeeded,
    /// Some step failed (or the script was cut short), but nothing is held
    Failed,
    /// Still holding a lock at the end of the run
    Locked,
}

impl TerminalStatus {
    /// Classify a connection from what it holds and what its runner saw
    pub fn classify(holds_locks: bool, summary: &RunnerSummary) -> Self {
        if holds_locks {
            TerminalStatus::Locked
        } else if summary.failed_steps > 0 || summary.cancelled || summary.abandoned {
            TerminalStatus::Failed
        } else {
            TerminalStatus::Succeeded
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Succeeded => f.write_str("succeeded"),
            TerminalStatus::Failed => f.write_str("failed"),
            TerminalStatus::Locked => f.write_str("locked"),
        }
    }
}

/// Verdict without details, as written in expectations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    /// No lock survived the run
    Recoverable,
    /// Some lock survived the run; only a restart clears it
    PermanentlyLocked,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictKind::Recoverable => f.write_str("recoverable"),
            VerdictKind::PermanentlyLocked => f.write_str("PERMANENTLY LOCKED"),
        }
    }
}

/// How one database ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatabaseVerdict {
    /// Every lock was released
    Recoverable,
    /// Locks are still held by these connections
    PermanentlyLocked {
        /// Names of the holding connections
        holders: Vec<String>,
    },
}

impl DatabaseVerdict {
    /// Verdict without details
    pub fn kind(&self) -> VerdictKind {
        match self {
            DatabaseVerdict::Recoverable => VerdictKind::Recoverable,
            DatabaseVerdict::PermanentlyLocked { .. } => VerdictKind::PermanentlyLocked,
        }
    }
}

/// How one connection ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    /// Connection id
    pub id: ConnectionId,
    /// Scenario name
    pub name: String,
    /// Database it was opened on
    pub database: DatabaseName,
    /// Its cache mode
    pub cache: CacheMode,
    /// File lock held at the end of the run
    pub final_lock: LockLevel,
    /// Still inside an explicit transaction
    pub in_transaction: bool,
    /// Terminal status
    pub status: TerminalStatus,
    /// What its runner did
    pub summary: RunnerSummary,
}

/// How one database ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseReport {
    /// Database name
    pub name: DatabaseName,
    /// Lock state at the end of the run, before teardown
    pub snapshot: LockSnapshot,
    /// Rows committed per table
    pub committed_rows: BTreeMap<String, u64>,
    /// Verdict
    pub verdict: DatabaseVerdict,
}

/// Everything a run produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Scenario name
    pub scenario: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Wall time of the run
    pub duration_ms: u64,
    /// The run timeout fired and cancelled connections
    pub timed_out: bool,
    /// Every recorded step, in order
    pub timeline: Vec<TimelineEntry>,
    /// Per connection, in scenario order
    pub connections: Vec<ConnectionReport>,
    /// Per database, ordered by name
    pub databases: Vec<DatabaseReport>,
}

impl RunReport {
    /// Overall verdict: permanently locked if any database is
    pub fn verdict(&self) -> VerdictKind {
        if self
            .databases
            .iter()
            .any(|db| db.verdict.kind() == VerdictKind::PermanentlyLocked)
        {
            VerdictKind::PermanentlyLocked
        } else {
            VerdictKind::Recoverable
        }
    }

    /// True if no lock survived the run
    pub fn is_recoverable(&self) -> bool {
        self.verdict() == VerdictKind::Recoverable
    }

    /// Names of connections still holding locks
    pub fn holders(&self) -> Vec<String> {
        self.databases
            .iter()
            .flat_map(|db| match &db.verdict {
                DatabaseVerdict::PermanentlyLocked { holders } => holders.clone(),
                DatabaseVerdict::Recoverable => Vec::new(),
            })
            .collect()
    }

    /// Report of a connection by name
    pub fn connection(&self, name: &str) -> Option<&ConnectionReport> {
        self.connections.iter().find(|c| c.name == name)
    }

    /// Report of a database by name
    pub fn database(&self, name: &DatabaseName) -> Option<&DatabaseReport> {
        self.databases.iter().find(|db| &db.name == name)
    }

    /// Rows committed across every database
    pub fn committed_rows(&self) -> u64 {
        self.databases
            .iter()
            .flat_map(|db| db.committed_rows.values())
            .sum()
    }

    /// Timeline entries of one connection, by name
    pub fn entries_for(&self, name: &str) -> Vec<&TimelineEntry> {
        self.timeline.iter().filter(|e| e.name == name).collect()
    }

    /// Check every snapshot on the timeline against the lock invariants
    ///
    /// Returns the first violation, naming the entry it was found on.
    pub fn validate_timeline(&self) -> std::result::Result<(), String> {
        for entry in &self.timeline {
            entry
                .snapshot
                .validate()
                .map_err(|e| format!("entry #{} ({} {}): {}", entry.seq, entry.name, entry.step, e))?;
        }
        Ok(())
    }

    /// One line stating the verdict
    pub fn summary(&self) -> String {
        let mut line = format!("{}: {}", self.scenario, self.verdict());
        match self.verdict() {
            VerdictKind::Recoverable => {
                line.push_str(&format!(", {} row(s) committed", self.committed_rows()));
            }
            VerdictKind::PermanentlyLocked => {
                let held: Vec<String> = self
                    .databases
                    .iter()
                    .filter(|db| db.verdict.kind() == VerdictKind::PermanentlyLocked)
                    .map(|db| {
                        format!(
                            "{} held at {} by {}",
                            db.name,
                            db.snapshot.state,
                            self.holder_names(db).join(", ")
                        )
                    })
                    .collect();
                line.push_str(&format!(", {}", held.join("; ")));
            }
        }
        if self.timed_out {
            line.push_str(" (run timed out)");
        }
        line
    }

    fn holder_names(&self, db: &DatabaseReport) -> Vec<String> {
        match &db.verdict {
            DatabaseVerdict::PermanentlyLocked { holders } => holders.clone(),
            DatabaseVerdict::Recoverable => Vec::new(),
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Compare against expectations; returns one message per mismatch
    pub fn verify(&self, expect: &Expectations) -> Vec<String> {
        let mut mismatches = Vec::new();

        if let Some(verdict) = expect.verdict {
            if self.verdict() != verdict {
                mismatches.push(format!(
                    "verdict: expected {}, got {}",
                    verdict,
                    self.verdict()
                ));
            }
        }
        if let Some(timed_out) = expect.timed_out {
            if self.timed_out != timed_out {
                mismatches.push(format!(
                    "timed_out: expected {}, got {}",
                    timed_out, self.timed_out
                ));
            }
        }
        for (name, state) in &expect.final_state {
            match self.database(name) {
                Some(db) if db.snapshot.state == *state => {}
                Some(db) => mismatches.push(format!(
                    "database {}: expected final state {}, got {}",
                    name, state, db.snapshot.state
                )),
                None => mismatches.push(format!("database {}: never opened", name)),
            }
        }
        for (name, status) in &expect.connections {
            match self.connection(name) {
                Some(conn) if conn.status == *status => {}
                Some(conn) => mismatches.push(format!(
                    "connection {}: expected {}, got {}",
                    name, status, conn.status
                )),
                None => mismatches.push(format!("connection {}: not in run", name)),
            }
        }
        if let Some(rows) = expect.committed_rows {
            if self.committed_rows() != rows {
                mismatches.push(format!(
                    "committed rows: expected {}, got {}",
                    rows,
                    self.committed_rows()
                ));
            }
        }

        mismatches
    }
}
