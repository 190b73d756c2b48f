//! Contention scheduler
//!
//! Runs every connection of a scenario on its own named thread against the
//! databases of one per-run `DatabaseRegistry`, waits for them up to the run
//! timeout, and builds the `RunReport`.
//!
//! ## Timeout
//!
//! When the timeout elapses the remaining runners are cancelled. They stop at
//! their next sleep or step boundary and hand their connections back with
//! every lock still held. Nothing is released on their behalf: a connection
//! that never committed is exactly the bug a run is meant to show. Each such
//! connection gets a `Locked` entry at the end of the timeline.
//!
//! Locks are only force-released by `ScenarioRun::teardown`, which is the
//! process exiting, after the report has been taken.
//!
//! ## Pools
//!
//! Pools declared by the scenario are opened before any thread starts. A
//! pooled connection runs as a `PooledWorker` that borrows from its pool for
//! every pass. On timeout the pools are closed as well, which wakes any
//! worker still waiting for a checkout.

use crate::cancel::CancelToken;
use crate::config::LockstepConfig;
use crate::report::{ConnectionReport, DatabaseReport, DatabaseVerdict, RunReport, TerminalStatus};
use crate::pool::{ConnectionPool, PooledWorker};
use crate::runner::{RunnerSummary, TransactionRunner};
use crate::scenario::Scenario;
use crate::timeline::{Outcome, Record, Timeline};
use chrono::Utc;
use lockstep_concurrency::{Connection, DatabaseRegistry, LockSnapshot};
use lockstep_core::{ConnectionId, DatabaseName, Error, LockLevel, Result};
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs scenarios
#[derive(Debug, Clone, Default)]
pub struct ContentionScheduler {
    config: LockstepConfig,
}

impl ContentionScheduler {
    /// Scheduler with the given configuration
    pub fn new(config: LockstepConfig) -> Self {
        Self { config }
    }

    /// Its configuration
    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    /// Run a scenario and leave its final state in place
    ///
    /// # Errors
    ///
    /// `Error::Scenario` if the scenario is invalid or a runner thread
    /// panicked, `Error::IoError` if a thread could not be spawned.
    pub fn run(&self, scenario: &Scenario) -> Result<ScenarioRun> {
        scenario.validate()?;
        let timeout = scenario
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.run_timeout());

        info!(
            scenario = %scenario.name,
            connections = scenario.connections.len(),
            timeout_ms = timeout.as_millis() as u64,
            "run started"
        );

        let registry = DatabaseRegistry::new();
        let timeline = Arc::new(Timeline::new());
        let cancel = CancelToken::new();
        let started_at = Utc::now();
        let start = Instant::now();

        let pools = self.open_pools(scenario, &registry);
        let mut workers = Vec::with_capacity(scenario.connections.len());
        for (index, spec) in scenario.connections.iter().enumerate() {
            let id = ConnectionId::new(index as u32 + 1);
            let worker = match &spec.pool {
                Some(name) => {
                    let pool = pools.get(name).ok_or_else(|| {
                        Error::scenario(format!("{} uses undeclared pool {}", spec.name, name))
                    })?;
                    Worker::Pooled(
                        PooledWorker::new(
                            id,
                            spec.name.clone(),
                            Arc::clone(pool),
                            spec.steps.clone(),
                            Arc::clone(&timeline),
                            cancel.clone(),
                        )
                        .with_iterations(spec.iterations())
                        .with_failure_policy(spec.on_failure)
                        .with_default_retry(self.config.retry),
                    )
                }
                None => {
                    let conn = Connection::open(
                        id,
                        spec.name.clone(),
                        registry.open(&spec.database_name()),
                        spec.cache,
                    );
                    Worker::Scripted(
                        TransactionRunner::new(
                            conn,
                            spec.steps.clone(),
                            spec.on_failure,
                            Arc::clone(&timeline),
                            cancel.clone(),
                        )
                        .with_default_retry(self.config.retry),
                    )
                }
            };
            workers.push(worker);
        }

        let (done_tx, done_rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(workers.len());
        for (index, (spec, worker)) in scenario.connections.iter().zip(workers).enumerate() {
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("lockstep-{}", spec.name))
                .spawn(move || {
                    let result = worker.run();
                    let _ = done.send(index);
                    result
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let the runners already started finish before failing
                    cancel.cancel();
                    close_pools(&pools);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }
        drop(done_tx);

        let timed_out = !wait_for(&done_rx, handles.len(), start + timeout);
        if timed_out {
            warn!(
                scenario = %scenario.name,
                timeout_ms = timeout.as_millis() as u64,
                "run timed out, cancelling unfinished connections"
            );
            cancel.cancel();
            close_pools(&pools);
        }

        let mut finished: Vec<(Option<Connection>, RunnerSummary)> =
            Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .join()
                .map_err(|_| Error::scenario(format!("a runner of {} panicked", scenario.name)))?;
            finished.push(result);
        }
        let pooled: Vec<Connection> = pools.values().flat_map(|pool| pool.drain()).collect();

        let owned = finished.iter().filter_map(|(conn, _)| conn.as_ref());
        for conn in owned.chain(&pooled) {
            let locks = conn.database().locks().session();
            let snapshot = locks.snapshot();
            if holds_locks(&snapshot, conn.id()) {
                warn!(
                    scenario = %scenario.name,
                    conn = %conn.id(),
                    name = conn.name(),
                    held = %snapshot.level_of(conn.id()),
                    "connection finished the run holding locks"
                );
                timeline.record_in(
                    &locks,
                    Record::new(conn.id(), conn.name(), "END", Outcome::Locked).with_detail(
                        format!("still holds {} at end of run", snapshot.level_of(conn.id())),
                    ),
                );
            }
        }

        let report = build_report(
            scenario,
            RunFacts {
                started_at,
                elapsed: start.elapsed(),
                timed_out,
            },
            &timeline,
            &registry,
            &pools,
            &finished,
            &pooled,
        );
        info!(
            scenario = %scenario.name,
            verdict = %report.verdict(),
            timed_out,
            entries = report.timeline.len(),
            "run finished"
        );

        let mut connections: Vec<Connection> =
            finished.into_iter().filter_map(|(conn, _)| conn).collect();
        connections.extend(pooled);
        Ok(ScenarioRun {
            report,
            registry,
            connections,
        })
    }

    /// Run a scenario, take its report, then tear it down
    pub fn simulate(&self, scenario: &Scenario) -> Result<RunReport> {
        let run = self.run(scenario)?;
        let report = run.report().clone();
        run.teardown();
        Ok(report)
    }

    /// Open every pool the scenario declares
    ///
    /// Pooled connections get ids after the scenario's own connections.
    fn open_pools(
        &self,
        scenario: &Scenario,
        registry: &DatabaseRegistry,
    ) -> BTreeMap<String, Arc<ConnectionPool>> {
        let mut next_id = scenario.connections.len() as u32 + 1;
        let mut pools = BTreeMap::new();
        for (name, spec) in &scenario.pools {
            let checkout_timeout = spec
                .checkout_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.pool_timeout());
            let pool = ConnectionPool::open(
                name.clone(),
                registry.open(&spec.database_name()),
                spec.cache,
                next_id,
                spec.size,
                checkout_timeout,
            );
            debug!(pool = %name, size = spec.size, first_id = next_id, "pool opened");
            next_id += spec.size as u32;
            pools.insert(name.clone(), Arc::new(pool));
        }
        pools
    }
}

/// One scenario connection, ready to run on its own thread
enum Worker {
    Scripted(TransactionRunner),
    Pooled(PooledWorker),
}

impl Worker {
    /// Run to completion; a pooled worker hands back no connection
    fn run(self) -> (Option<Connection>, RunnerSummary) {
        match self {
            Worker::Scripted(runner) => {
                let (conn, summary) = runner.run();
                (Some(conn), summary)
            }
            Worker::Pooled(worker) => (None, worker.run()),
        }
    }
}

fn close_pools(pools: &BTreeMap<String, Arc<ConnectionPool>>) {
    for pool in pools.values() {
        pool.close();
    }
}

/// Wait until no runner is still running or `deadline` passes
///
/// True if every runner thread has exited. Each runner sends its index when
/// its script ends; a runner that panicked drops its sender without sending.
/// Once every sender is gone the channel disconnects, which also means every
/// thread has exited, so the missing reports are panics. `run` joins the
/// handles right after and turns such a panic into `Error::Scenario`.
fn wait_for(done: &mpsc::Receiver<usize>, expected: usize, deadline: Instant) -> bool {
    let mut finished = 0;
    while finished < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(_) => finished += 1,
            Err(mpsc::RecvTimeoutError::Timeout) => return false,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(
                    silent = expected - finished,
                    "runner threads exited without reporting"
                );
                return true;
            }
        }
    }
    true
}

fn holds_locks(snapshot: &LockSnapshot, conn: ConnectionId) -> bool {
    snapshot.holders().contains(&conn)
}

/// Timing of one run
struct RunFacts {
    started_at: chrono::DateTime<Utc>,
    elapsed: Duration,
    timed_out: bool,
}

fn build_report(
    scenario: &Scenario,
    facts: RunFacts,
    timeline: &Timeline,
    registry: &DatabaseRegistry,
    pools: &BTreeMap<String, Arc<ConnectionPool>>,
    finished: &[(Option<Connection>, RunnerSummary)],
    pooled: &[Connection],
) -> RunReport {
    let connections = scenario
        .connections
        .iter()
        .zip(finished)
        .enumerate()
        .map(|(index, (spec, (conn, summary)))| {
            let id = ConnectionId::new(index as u32 + 1);
            let (database, cache) = match (conn, spec.pool.as_ref().and_then(|p| pools.get(p))) {
                (Some(conn), _) => (Arc::clone(conn.database()), conn.cache_mode()),
                (None, Some(pool)) => (Arc::clone(pool.database()), pool.cache_mode()),
                (None, None) => (registry.open(&spec.database_name()), spec.cache),
            };
            let snapshot = database.locks().snapshot();
            ConnectionReport {
                id,
                name: spec.name.clone(),
                database: database.name().clone(),
                cache,
                final_lock: conn.as_ref().map_or(LockLevel::Unlocked, Connection::held_lock),
                in_transaction: conn.as_ref().is_some_and(Connection::in_transaction),
                status: TerminalStatus::classify(holds_locks(&snapshot, id), summary),
                summary: summary.clone(),
            }
        })
        .collect();

    let names: BTreeMap<ConnectionId, &str> = scenario
        .connections
        .iter()
        .enumerate()
        .map(|(index, spec)| (ConnectionId::new(index as u32 + 1), spec.name.as_str()))
        .chain(pooled.iter().map(|conn| (conn.id(), conn.name())))
        .collect();
    let databases = registry
        .databases()
        .into_iter()
        .map(|db| {
            let snapshot = db.locks().snapshot();
            let verdict = if snapshot.is_unlocked() {
                DatabaseVerdict::Recoverable
            } else {
                DatabaseVerdict::PermanentlyLocked {
                    holders: snapshot
                        .holders()
                        .into_iter()
                        .map(|id| {
                            names
                                .get(&id)
                                .map_or_else(|| id.to_string(), |name| name.to_string())
                        })
                        .collect(),
                }
            };
            DatabaseReport {
                name: db.name().clone(),
                committed_rows: db.rows(),
                snapshot,
                verdict,
            }
        })
        .collect();

    RunReport {
        scenario: scenario.name.clone(),
        started_at: facts.started_at,
        duration_ms: facts.elapsed.as_millis() as u64,
        timed_out: facts.timed_out,
        timeline: timeline.entries(),
        connections,
        databases,
    }
}

/// A finished run whose locks are still in place
#[derive(Debug)]
pub struct ScenarioRun {
    report: RunReport,
    registry: DatabaseRegistry,
    connections: Vec<Connection>,
}

impl ScenarioRun {
    /// The run's report
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Connections as they ended: the scenario's own in scenario order,
    /// then every pooled connection
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Live lock state of one database
    pub fn snapshot(&self, name: &DatabaseName) -> Option<LockSnapshot> {
        self.registry.get(name).map(|db| db.locks().snapshot())
    }

    /// Close every connection, releasing whatever it still holds
    ///
    /// Returns each database's lock state afterwards.
    pub fn teardown(mut self) -> BTreeMap<DatabaseName, LockSnapshot> {
        for conn in &mut self.connections {
            conn.close();
        }
        self.registry
            .databases()
            .into_iter()
            .map(|db| (db.name().clone(), db.locks().snapshot()))
            .collect()
    }
}
