//! Scenario definitions
//!
//! A scenario is a named set of connection scripts plus what the run is
//! expected to end with. Scenarios are plain JSON:
//!
//! ```json
//! {
//!   "name": "two_reader_deadlock",
//!   "connections": [
//!     {"name": "alice", "steps": [{"op": "begin"}, {"op": "read"}, {"op": "commit"}]}
//!   ],
//!   "expect": {"verdict": "recoverable", "final_state": {"main": "UNLOCKED"}}
//! }
//! ```
//!
//! A scenario may also declare connection pools. A connection that names a
//! pool owns no connection of its own: it runs its steps `iterations` times,
//! each pass on a connection checked out of the pool.
//!
//! ```json
//! {
//!   "pools": {"app": {"size": 2, "checkout_timeout_ms": 20}},
//!   "connections": [{"name": "w1", "pool": "app", "iterations": 3, "steps": [{"op": "write"}]}]
//! }
//! ```

mod catalog;

pub use catalog::ScenarioCatalog;

use crate::report::{TerminalStatus, VerdictKind};
use crate::script::{FailurePolicy, Step};
use lockstep_core::{CacheMode, DatabaseName, Error, LockLevel, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// One scripted connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Name, unique within the scenario
    pub name: String,
    /// Database to open; `main` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseName>,
    /// Page cache mode
    #[serde(default)]
    pub cache: CacheMode,
    /// What to do after a failed step
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Pool to borrow a connection from for every pass; the connection's
    /// database and cache come from the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Passes over the script; pooled connections only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// The script
    pub steps: Vec<Step>,
}

impl ConnectionSpec {
    /// Connection on `main` with a private cache and default failure policy
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            database: None,
            cache: CacheMode::Private,
            on_failure: FailurePolicy::default(),
            pool: None,
            iterations: None,
            steps,
        }
    }

    /// Set the cache mode
    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Set the failure policy
    pub fn with_failure_policy(mut self, on_failure: FailurePolicy) -> Self {
        self.on_failure = on_failure;
        self
    }

    /// Open a named database instead of `main`
    pub fn on_database(mut self, database: DatabaseName) -> Self {
        self.database = Some(database);
        self
    }

    /// Borrow from a pool, running the script `iterations` times
    pub fn from_pool(mut self, pool: impl Into<String>, iterations: u32) -> Self {
        self.pool = Some(pool.into());
        self.iterations = Some(iterations);
        self
    }

    /// Database this connection opens
    pub fn database_name(&self) -> DatabaseName {
        self.database.clone().unwrap_or_default()
    }

    /// Passes over the script
    pub fn iterations(&self) -> u32 {
        self.iterations.unwrap_or(1)
    }
}

/// A fixed-size connection pool shared by pooled connections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Connections in the pool
    pub size: usize,
    /// Database the pool opens; `main` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseName>,
    /// Page cache mode of the pooled connections
    #[serde(default)]
    pub cache: CacheMode,
    /// How long a checkout waits; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_timeout_ms: Option<u64>,
}

impl PoolSpec {
    /// Pool of `size` private-cache connections on `main`
    pub fn new(size: usize) -> Self {
        Self {
            size,
            database: None,
            cache: CacheMode::Private,
            checkout_timeout_ms: None,
        }
    }

    /// Set the checkout timeout
    pub fn with_checkout_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.checkout_timeout_ms = Some(timeout_ms);
        self
    }

    /// Database the pool opens
    pub fn database_name(&self) -> DatabaseName {
        self.database.clone().unwrap_or_default()
    }
}

/// What a run is expected to end with; unset fields are not checked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    /// Overall verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictKind>,
    /// Whether the run timeout fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<bool>,
    /// Final lock state per database, before teardown
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub final_state: BTreeMap<DatabaseName, LockLevel>,
    /// Terminal status per connection name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connections: BTreeMap<String, TerminalStatus>,
    /// Rows committed across every database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_rows: Option<u64>,
}

/// A runnable scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name
    pub name: String,
    /// What the scenario demonstrates
    #[serde(default)]
    pub description: String,
    /// Run timeout; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Connection pools by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pools: BTreeMap<String, PoolSpec>,
    /// Connections, each run on its own thread
    pub connections: Vec<ConnectionSpec>,
    /// Expected terminal outcome
    #[serde(default)]
    pub expect: Expectations,
}

impl Scenario {
    /// Scenario with no description, timeout or expectations
    pub fn new(name: impl Into<String>, connections: Vec<ConnectionSpec>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            timeout_ms: None,
            pools: BTreeMap::new(),
            connections,
            expect: Expectations::default(),
        }
    }

    /// Set the run timeout
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Declare a connection pool
    pub fn with_pool(mut self, name: impl Into<String>, pool: PoolSpec) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    /// Set the expectations
    pub fn with_expectations(mut self, expect: Expectations) -> Self {
        self.expect = expect;
        self
    }

    /// Parse and validate a scenario from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Scenario = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Read, parse and validate a scenario file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| {
            Error::scenario(format!("{}: {}", path.display(), e))
        })
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the scenario can be run
    ///
    /// Rejects an empty name, no connections, duplicate or empty connection
    /// names, expectations naming unknown connections, a zero timeout, and
    /// retry on a write that sits inside an explicit transaction. Pools must
    /// be non-empty, and a pooled connection must name a declared pool and
    /// leave its database to the pool.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::scenario("scenario name is empty"));
        }
        if self.connections.is_empty() {
            return Err(Error::scenario(format!(
                "scenario {} has no connections",
                self.name
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::scenario(format!(
                "scenario {} has a zero timeout",
                self.name
            )));
        }

        if let Some((name, _)) = self.pools.iter().find(|(_, pool)| pool.size == 0) {
            return Err(Error::scenario(format!(
                "scenario {} declares pool {} with no connections",
                self.name, name
            )));
        }

        let mut names = BTreeSet::new();
        for spec in &self.connections {
            if spec.name.trim().is_empty() {
                return Err(Error::scenario(format!(
                    "scenario {} has a connection without a name",
                    self.name
                )));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::scenario(format!(
                    "scenario {} names connection {} twice",
                    self.name, spec.name
                )));
            }
            self.validate_pool_use(spec)?;
            validate_steps(&self.name, spec)?;
        }

        if let Some(unknown) = self
            .expect
            .connections
            .keys()
            .find(|name| !names.contains(name.as_str()))
        {
            return Err(Error::scenario(format!(
                "scenario {} expects an outcome for unknown connection {}",
                self.name, unknown
            )));
        }
        Ok(())
    }
}

impl Scenario {
    fn validate_pool_use(&self, spec: &ConnectionSpec) -> Result<()> {
        match &spec.pool {
            Some(pool) if !self.pools.contains_key(pool) => Err(Error::scenario(format!(
                "scenario {}: connection {} uses undeclared pool {}",
                self.name, spec.name, pool
            ))),
            Some(_) if spec.database.is_some() => Err(Error::scenario(format!(
                "scenario {}: pooled connection {} names its own database",
                self.name, spec.name
            ))),
            None if spec.iterations.is_some() => Err(Error::scenario(format!(
                "scenario {}: connection {} sets iterations without a pool",
                self.name, spec.name
            ))),
            _ if spec.iterations == Some(0) => Err(Error::scenario(format!(
                "scenario {}: connection {} has zero iterations",
                self.name, spec.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Retry is only legal on autocommit writes. Tracked statically: a `Begin`
/// opens a transaction until the next `Commit` or `Rollback`.
fn validate_steps(scenario: &str, spec: &ConnectionSpec) -> Result<()> {
    let mut in_transaction = false;
    for (i, step) in spec.steps.iter().enumerate() {
        match step {
            Step::Begin { .. } => in_transaction = true,
            Step::Commit | Step::Rollback => in_transaction = false,
            Step::Write { retry: Some(_), .. } if in_transaction => {
                return Err(Error::scenario(format!(
                    "scenario {}: connection {} step {} retries a write inside a transaction",
                    scenario, spec.name, i
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
