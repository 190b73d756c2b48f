//! Connection pool
//!
//! A fixed set of connections on one database, lent out one checkout at a
//! time. A checkout waits on a condvar for a free connection, up to the
//! pool's checkout timeout, and then fails with `Error::PoolTimeout`.
//! Checking a connection back in rolls it back first, so whatever its
//! borrower left open (a refused write, an abandoned transaction) is released
//! before anyone else can borrow it. A pool therefore cannot leak locks the
//! way a long-lived connection can; it can only run out of connections.
//!
//! A `PooledWorker` runs its script once per iteration, each on a freshly
//! checked out connection, like a thread that wraps every unit of work in a
//! pooled session.

use crate::cancel::CancelToken;
use crate::runner::{RunnerState, RunnerSummary, TransactionRunner};
use crate::script::{FailurePolicy, RetryPolicy, Step};
use crate::timeline::{BusyScope, Outcome, Record, Timeline};
use lockstep_concurrency::{Connection, Database, LockSession};
use lockstep_core::{CacheMode, ConnectionId, Error, LockLevel, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    closed: bool,
}

/// Fixed-size pool of connections on one database
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    size: usize,
    database: Arc<Database>,
    cache: CacheMode,
    checkout_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Open `size` connections on `database`
    ///
    /// Connections get consecutive ids from `first_id` and are named
    /// `<pool>#1`, `<pool>#2`, ...
    pub fn open(
        name: impl Into<String>,
        database: Arc<Database>,
        cache: CacheMode,
        first_id: u32,
        size: usize,
        checkout_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let idle = (0..size)
            .map(|n| {
                Connection::open(
                    ConnectionId::new(first_id + n as u32),
                    format!("{}#{}", name, n + 1),
                    Arc::clone(&database),
                    cache,
                )
            })
            .collect();
        Self {
            name,
            size,
            database,
            cache,
            checkout_timeout,
            state: Mutex::new(PoolState {
                idle,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connections owned by the pool, checked out or not
    pub fn size(&self) -> usize {
        self.size
    }

    /// Database every pooled connection is open on
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Cache mode of the pooled connections
    pub fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    /// How long a checkout waits
    pub fn checkout_timeout(&self) -> Duration {
        self.checkout_timeout
    }

    /// Connections currently waiting in the pool
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Borrow a connection, waiting up to the checkout timeout
    ///
    /// Connections are lent oldest-returned first.
    ///
    /// # Errors
    ///
    /// `Error::PoolTimeout` if none came back in time, `Error::PoolClosed`
    /// if the pool was closed first.
    pub fn checkout(&self) -> Result<Connection> {
        let started = Instant::now();
        let deadline = started + self.checkout_timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(Error::PoolClosed(self.name.clone()));
            }
            if let Some(conn) = state.idle.pop_front() {
                debug!(pool = %self.name, conn = %conn.id(), idle = state.idle.len(), "checked out");
                return Ok(conn);
            }
            if Instant::now() >= deadline {
                let waited_ms = started.elapsed().as_millis() as u64;
                debug!(pool = %self.name, size = self.size, waited_ms, "checkout timed out");
                return Err(Error::PoolTimeout {
                    pool: self.name.clone(),
                    size: self.size,
                    waited_ms,
                });
            }
            self.available.wait_until(&mut state, deadline);
        }
    }

    /// Return a connection, rolling it back first
    pub fn checkin(&self, conn: Connection) {
        self.checkin_with(conn, |_| ())
    }

    /// `checkin`, running `f` under the rollback's lock session
    pub fn checkin_with<R>(
        &self,
        mut conn: Connection,
        f: impl FnOnce(&LockSession<'_>) -> R,
    ) -> R {
        if conn.held_lock() != LockLevel::Unlocked || conn.in_transaction() {
            debug!(
                pool = %self.name,
                conn = %conn.id(),
                held = %conn.held_lock(),
                "reset on checkin releases locks"
            );
        }
        let result = conn.rollback_with(f);

        let mut state = self.state.lock();
        state.idle.push_back(conn);
        self.available.notify_one();
        result
    }

    /// Refuse every further checkout and wake every waiting one
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
    }

    /// Take every connection currently in the pool
    pub fn drain(&self) -> Vec<Connection> {
        self.state.lock().idle.drain(..).collect()
    }
}

/// Runs one script repeatedly, each pass on a pooled connection
pub struct PooledWorker {
    id: ConnectionId,
    name: String,
    pool: Arc<ConnectionPool>,
    steps: Vec<Step>,
    iterations: u32,
    on_failure: FailurePolicy,
    default_retry: RetryPolicy,
    timeline: Arc<Timeline>,
    cancel: CancelToken,
}

impl PooledWorker {
    /// Worker that runs `steps` once
    pub fn new(
        id: ConnectionId,
        name: impl Into<String>,
        pool: Arc<ConnectionPool>,
        steps: Vec<Step>,
        timeline: Arc<Timeline>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            pool,
            steps,
            iterations: 1,
            on_failure: FailurePolicy::default(),
            default_retry: RetryPolicy::default(),
            timeline,
            cancel,
        }
    }

    /// Run the script this many times
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// What to do after a failed step within one pass
    pub fn with_failure_policy(mut self, on_failure: FailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Policy used by writes that ask for `"retry": true`
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Worker id; it never holds a lock itself
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Run every iteration, or until cancelled
    ///
    /// A checkout that times out counts as one failed step and the worker
    /// moves on to its next iteration. Every connection it borrowed is back
    /// in the pool, rolled back, when this returns.
    pub fn run(self) -> RunnerSummary {
        let mut summary = RunnerSummary::default();
        let locks = self.pool.database().locks();

        for iteration in 1..=self.iterations {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let checkout = format!("CHECKOUT {}", self.pool.name());
            summary.steps_run += 1;
            let conn = match self.pool.checkout() {
                Ok(conn) => conn,
                Err(e) => {
                    let outcome = Outcome::Busy {
                        scope: BusyScope::Pool(self.pool.name().to_string()),
                    };
                    self.timeline.record(
                        locks,
                        Record::new(self.id, &self.name, checkout, outcome).with_detail(e.to_string()),
                    );
                    debug!(conn = %self.id, iteration, error = %e, "checkout failed");
                    summary.failed_steps += 1;
                    summary.last_error = Some(e.to_string());
                    summary.final_state = RunnerState::Failed;
                    continue;
                }
            };
            self.timeline.record(
                locks,
                Record::new(conn.id(), &self.name, checkout, Outcome::Success)
                    .with_detail(format!("{} (iteration {})", conn.name(), iteration)),
            );

            let runner = TransactionRunner::new(
                conn,
                self.steps.clone(),
                self.on_failure,
                Arc::clone(&self.timeline),
                self.cancel.clone(),
            )
            .with_default_retry(self.default_retry)
            .with_name(self.name.clone());
            let (conn, pass) = runner.run();
            summary.absorb(&pass);

            let record = Record::new(
                conn.id(),
                &self.name,
                format!("CHECKIN {}", self.pool.name()),
                Outcome::Success,
            )
            .with_detail("reset, locks released");
            let timeline = &self.timeline;
            self.pool
                .checkin_with(conn, |locks| timeline.record_in(locks, record));

            if pass.cancelled {
                break;
            }
        }

        summary
    }
}
