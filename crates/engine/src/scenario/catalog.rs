//! Scenario catalog
//!
//! The built-in scenarios are JSON files compiled into the crate. More can be
//! loaded from a directory of `*.json` files without touching the engine.

use super::Scenario;
use crate::config::LockstepConfig;
use lockstep_core::{Error, Result};
use std::path::Path;
use tracing::debug;

const BUILTIN: &[(&str, &str)] = &[
    (
        "two_reader_deadlock",
        include_str!("../../scenarios/two_reader_deadlock.json"),
    ),
    ("double_begin", include_str!("../../scenarios/double_begin.json")),
    (
        "pending_starvation",
        include_str!("../../scenarios/pending_starvation.json"),
    ),
    (
        "shared_cache_table_lock",
        include_str!("../../scenarios/shared_cache_table_lock.json"),
    ),
    (
        "commit_in_finally",
        include_str!("../../scenarios/commit_in_finally.json"),
    ),
    (
        "shared_connection_leak",
        include_str!("../../scenarios/shared_connection_leak.json"),
    ),
    ("stuck_pending", include_str!("../../scenarios/stuck_pending.json")),
    (
        "backoff_recovery",
        include_str!("../../scenarios/backoff_recovery.json"),
    ),
    ("pool_stress", include_str!("../../scenarios/pool_stress.json")),
];

/// Named scenarios, in insertion order
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: Vec<Scenario>,
}

impl ScenarioCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in scenarios
    pub fn builtin() -> Result<Self> {
        let mut catalog = Self::new();
        for (file, json) in BUILTIN {
            let scenario = Scenario::from_json(json)
                .map_err(|e| Error::scenario(format!("built-in {}: {}", file, e)))?;
            catalog.insert(scenario)?;
        }
        Ok(catalog)
    }

    /// Built-ins plus the configured `scenario_dir`, if any
    pub fn from_config(config: &LockstepConfig) -> Result<Self> {
        let mut catalog = Self::builtin()?;
        if let Some(dir) = &config.scenario_dir {
            catalog.load_dir(dir)?;
        }
        Ok(catalog)
    }

    /// Add every `*.json` file in `dir`, in file name order
    ///
    /// Returns how many scenarios were added.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let scenario = Scenario::from_file(path)?;
            debug!(scenario = %scenario.name, path = %path.display(), "scenario loaded");
            self.insert(scenario)?;
        }
        Ok(paths.len())
    }

    /// Add a scenario
    ///
    /// # Errors
    ///
    /// `Error::Scenario` if it is invalid or its name is taken.
    pub fn insert(&mut self, scenario: Scenario) -> Result<()> {
        scenario.validate()?;
        if self.get(&scenario.name).is_some() {
            return Err(Error::scenario(format!(
                "scenario {} is already in the catalog",
                scenario.name
            )));
        }
        self.scenarios.push(scenario);
        Ok(())
    }

    /// Look a scenario up by name
    pub fn get(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Scenario names, in insertion order
    pub fn names(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.name.as_str()).collect()
    }

    /// Iterate over scenarios
    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.iter()
    }

    /// Number of scenarios
    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    /// True if the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
