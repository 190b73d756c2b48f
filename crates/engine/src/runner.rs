//! Transaction runner
//!
//! Drives one connection through its script on its own thread and turns every
//! result into a timeline entry.
//!
//! ## State machine
//!
//! ```text
//! Idle -> Reading -> WritePending -> Committing -> Idle
//!   \________\___________\______________\-> Failed -> Idle
//! ```
//!
//! A failed step moves the runner to `Failed`; what happens next is the
//! script's `FailurePolicy`. With the default `SkipToCommit` the runner jumps
//! to the next `Commit`/`Rollback` and runs it, exactly like a `commit()` in
//! a `finally` clause.
//!
//! ## Retry
//!
//! A write outside an explicit transaction may carry a `RetryPolicy`. Each
//! attempt is a fresh autocommit statement: a refused attempt has already
//! released everything before the runner backs off. Attempt number and
//! backoff are recorded on the attempt's timeline entry. Nothing inside an
//! explicit transaction is ever retried.

use crate::cancel::CancelToken;
use crate::script::{FailurePolicy, RetryPolicy, Step};
use crate::timeline::{Outcome, Record, Timeline};
use lockstep_concurrency::{CommitStatus, Connection, LockSession};
use lockstep_core::{ConnectionId, Error, LockError, TransactionMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a runner is in its transaction lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// No statement in progress, nothing held by an open transaction
    #[default]
    Idle,
    /// Inside a transaction that has read
    Reading,
    /// Inside a transaction with buffered writes
    WritePending,
    /// COMMIT in progress
    Committing,
    /// The last step failed
    Failed,
}

/// What a runner did, handed back to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSummary {
    /// Steps executed, sleeps included
    pub steps_run: usize,
    /// Steps passed over by `SkipToCommit`
    pub steps_skipped: usize,
    /// Steps whose final outcome was not success
    pub failed_steps: usize,
    /// Extra write attempts made by retry
    pub retries: u32,
    /// Message of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Script stopped by `Abandon`
    pub abandoned: bool,
    /// Run timeout cancelled the script before it finished
    pub cancelled: bool,
    /// State when the script stopped
    pub final_state: RunnerState,
}

impl RunnerSummary {
    /// Fold in the summary of a later pass over the script
    pub fn absorb(&mut self, pass: &RunnerSummary) {
        self.steps_run += pass.steps_run;
        self.steps_skipped += pass.steps_skipped;
        self.failed_steps += pass.failed_steps;
        self.retries += pass.retries;
        if pass.last_error.is_some() {
            self.last_error = pass.last_error.clone();
        }
        self.abandoned |= pass.abandoned;
        self.cancelled |= pass.cancelled;
        self.final_state = pass.final_state;
    }
}

/// Executes one connection's script
pub struct TransactionRunner {
    conn: Connection,
    name: String,
    steps: Vec<Step>,
    on_failure: FailurePolicy,
    default_retry: RetryPolicy,
    timeline: Arc<Timeline>,
    cancel: CancelToken,
    state: RunnerState,
    summary: RunnerSummary,
}

impl TransactionRunner {
    /// Create a runner for `conn`
    pub fn new(
        conn: Connection,
        steps: Vec<Step>,
        on_failure: FailurePolicy,
        timeline: Arc<Timeline>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: conn.name().to_string(),
            conn,
            steps,
            on_failure,
            default_retry: RetryPolicy::default(),
            timeline,
            cancel,
            state: RunnerState::Idle,
            summary: RunnerSummary::default(),
        }
    }

    /// Policy used by writes that ask for `"retry": true`
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Name recorded on timeline entries instead of the connection's own
    ///
    /// Used when the connection is borrowed from a pool.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Current state
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Run the script to its end, its abandonment, or cancellation
    ///
    /// Returns the connection with whatever locks it still holds.
    pub fn run(mut self) -> (Connection, RunnerSummary) {
        let steps = std::mem::take(&mut self.steps);
        let mut index = 0;

        while index < steps.len() {
            if self.cancel.is_cancelled() {
                self.summary.cancelled = true;
                break;
            }

            let step = &steps[index];
            index += 1;
            self.summary.steps_run += 1;

            if self.execute(step) {
                continue;
            }
            if self.cancel.is_cancelled() {
                self.summary.cancelled = true;
                break;
            }

            self.state = RunnerState::Failed;
            self.summary.failed_steps += 1;
            match self.on_failure {
                FailurePolicy::Continue => {}
                FailurePolicy::SkipToCommit => {
                    let next = steps[index..]
                        .iter()
                        .position(Step::ends_transaction)
                        .map_or(steps.len(), |offset| index + offset);
                    if next > index {
                        debug!(
                            conn = %self.conn.id(),
                            skipped = next - index,
                            "skipping to commit"
                        );
                    }
                    self.summary.steps_skipped += next - index;
                    index = next;
                }
                FailurePolicy::Abandon => {
                    debug!(conn = %self.conn.id(), held = %self.conn.held_lock(), "script abandoned");
                    self.summary.abandoned = true;
                    break;
                }
            }
        }

        self.summary.final_state = self.state;
        (self.conn, self.summary)
    }

    /// Run one step; true on success
    ///
    /// Every statement's entry is recorded from inside the statement's own
    /// lock session, so the timeline orders steps exactly as the lock
    /// manager did.
    fn execute(&mut self, step: &Step) -> bool {
        match step {
            Step::Sleep { ms } => self.cancel.sleep(Duration::from_millis(*ms)),
            Step::Begin { mode } => self.begin(step, *mode),
            Step::Read { table } => {
                let record = self.statement(step);
                let timeline = &self.timeline;
                let (result, outcome) = self.conn.read_with(table, |result, locks| {
                    let record = match &result {
                        Ok(()) => record,
                        Err(e) => failed(record, e),
                    };
                    (result, stamp(timeline, locks, record))
                });
                if result.is_ok() {
                    self.state = match (self.conn.in_transaction(), self.state) {
                        (false, _) => RunnerState::Idle,
                        (true, RunnerState::WritePending) => RunnerState::WritePending,
                        (true, _) => RunnerState::Reading,
                    };
                }
                self.finish(step, &outcome, result.err().map(|e| e.to_string()))
            }
            Step::Write { table, retry } => {
                let policy = if self.conn.in_transaction() {
                    None
                } else {
                    retry.as_ref().and_then(|r| r.resolve(&self.default_retry))
                };
                match policy {
                    Some(policy) => self.write_with_retry(step, table, policy),
                    None => {
                        let record = self.statement(step);
                        let timeline = &self.timeline;
                        let (result, outcome) = self.conn.write_with(table, |result, locks| {
                            let record = match &result {
                                Ok(()) => record,
                                Err(e) => failed(record, e),
                            };
                            (result, stamp(timeline, locks, record))
                        });
                        if result.is_ok() {
                            self.state = if self.conn.in_transaction() {
                                RunnerState::WritePending
                            } else {
                                RunnerState::Idle
                            };
                        }
                        self.finish(step, &outcome, result.err().map(|e| e.to_string()))
                    }
                }
            }
            Step::Commit => self.commit(step),
            Step::Rollback => {
                let record = self.statement(step);
                let timeline = &self.timeline;
                let outcome = self
                    .conn
                    .rollback_with(|locks| stamp(timeline, locks, record));
                self.state = RunnerState::Idle;
                self.finish(step, &outcome, None)
            }
        }
    }

    fn begin(&mut self, step: &Step, mode: TransactionMode) -> bool {
        let record = self.statement(step);
        let timeline = &self.timeline;
        let (outcome, error) = self.conn.begin_with(mode, |result, locks| {
            let (record, error) = match result {
                Ok(()) => (record, None),
                Err(Error::Lock(e)) => (failed(record, &e), Some(e.to_string())),
                Err(e) => {
                    let reason = e.to_string();
                    let record = Record {
                        outcome: Outcome::Invalid {
                            reason: reason.clone(),
                        },
                        ..record
                    };
                    (record, Some(reason))
                }
            };
            (stamp(timeline, locks, record), error)
        });
        if outcome.is_success() {
            self.state = RunnerState::Idle;
        }
        self.finish(step, &outcome, error)
    }

    fn commit(&mut self, step: &Step) -> bool {
        self.state = RunnerState::Committing;
        let record = self.statement(step);
        let timeline = &self.timeline;
        let (status, outcome) = self.conn.commit_with(|status, locks| {
            let record = match &status {
                CommitStatus::Committed { rows } => {
                    record.with_detail(format!("released, {} row(s) committed", rows))
                }
                CommitStatus::NoTransaction => record.with_detail("released, no transaction open"),
                CommitStatus::Blocked(e) => failed(record, e),
            };
            (status, stamp(timeline, locks, record))
        });
        let error = match status {
            CommitStatus::Blocked(e) => Some(e.to_string()),
            CommitStatus::Committed { .. } | CommitStatus::NoTransaction => {
                self.state = RunnerState::Idle;
                None
            }
        };
        self.finish(step, &outcome, error)
    }

    fn write_with_retry(&mut self, step: &Step, table: &str, policy: RetryPolicy) -> bool {
        let mut attempt = 0;
        loop {
            let record = self.statement(step);
            let timeline = &self.timeline;
            let (result, backoff, outcome) = self.conn.write_with(table, |result, locks| {
                let (record, backoff) = match &result {
                    Ok(()) => (record.with_attempt(attempt, None), None),
                    Err(e) => {
                        let retry = e.is_busy() && attempt < policy.max_retries;
                        let backoff = retry.then(|| policy.calculate_delay(attempt));
                        let record = failed(record, e)
                            .with_attempt(attempt, backoff.map(|d| d.as_millis() as u64));
                        (record, backoff)
                    }
                };
                (result, backoff, stamp(timeline, locks, record))
            });

            if result.is_ok() {
                self.state = RunnerState::Idle;
            }
            if self.finish(step, &outcome, result.err().map(|e| e.to_string())) {
                return true;
            }

            let Some(delay) = backoff else {
                return false;
            };
            debug!(
                conn = %self.conn.id(),
                attempt,
                backoff_ms = delay.as_millis() as u64,
                "write refused, backing off"
            );
            if !self.cancel.sleep(delay) {
                return false;
            }
            attempt += 1;
            self.summary.retries += 1;
        }
    }

    /// Successful entry for `step`, to be adjusted once the result is known
    fn statement(&self, step: &Step) -> Record {
        Record::new(self.conn.id(), &self.name, step.to_string(), Outcome::Success)
    }

    /// Log a recorded step; true if the outcome was a success
    fn finish(&mut self, step: &Step, outcome: &Outcome, error: Option<String>) -> bool {
        debug!(
            conn = %self.conn.id(),
            %step,
            %outcome,
            held = %self.conn.held_lock(),
            "step"
        );
        if let Some(error) = error {
            self.summary.last_error = Some(error);
        }
        outcome.is_success()
    }
}

/// Turn `record` into the entry for a refused statement
fn failed(record: Record, err: &LockError) -> Record {
    Record {
        outcome: Outcome::from_lock_error(err),
        ..record
    }
    .with_detail(err.to_string())
}

/// Append `record` under the statement's session and hand back its outcome
fn stamp(timeline: &Timeline, locks: &LockSession<'_>, record: Record) -> Outcome {
    let outcome = record.outcome.clone();
    timeline.record_in(locks, record);
    outcome
}
