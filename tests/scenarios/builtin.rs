//! Every built-in scenario meets its own expectations

use crate::common::*;
use lockstep::{FailurePolicy, RetrySetting, TransactionMode};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn every_builtin_matches_its_expectations() {
    let catalog = ScenarioCatalog::builtin().unwrap();
    assert!(catalog.len() >= 8);
    for name in catalog.names() {
        let report = run_builtin(name);
        assert_eq!(report.scenario, name);
        assert!(!report.timeline.is_empty(), "{} recorded nothing", name);
    }
}

#[test]
fn report_serializes_to_json() {
    let report = run_builtin("stuck_pending");
    let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    assert_eq!(json["scenario"], "stuck_pending");
    assert_eq!(json["databases"][0]["verdict"]["kind"], "permanently_locked");
    assert_eq!(json["databases"][0]["snapshot"]["state"], "PENDING");
}

#[test]
fn summary_names_the_holder() {
    let report = run_builtin("pending_starvation");
    let summary = report.summary();
    assert!(summary.starts_with("pending_starvation: PERMANENTLY LOCKED"), "{}", summary);
    assert!(summary.contains("reader"), "{}", summary);
    assert!(summary.ends_with("(run timed out)"), "{}", summary);

    let report = run_builtin("backoff_recovery");
    assert_eq!(
        report.summary(),
        "backoff_recovery: recoverable, 1 row(s) committed"
    );
}

#[test]
fn directory_scenarios_run_like_builtins() {
    let dir = TempDir::new().unwrap();
    let scenario = Scenario::new(
        "extra_autocommit",
        vec![ConnectionSpec::new(
            "a",
            vec![
                Step::write(),
                Step::Write {
                    table: "orders".to_string(),
                    retry: Some(RetrySetting::Enabled(true)),
                },
            ],
        )
        .with_failure_policy(FailurePolicy::Continue)],
    );
    std::fs::write(
        dir.path().join("extra_autocommit.json"),
        scenario.to_json().unwrap(),
    )
    .unwrap();

    let config = LockstepConfig {
        scenario_dir: Some(dir.path().to_path_buf()),
        ..LockstepConfig::default()
    };
    let catalog = ScenarioCatalog::from_config(&config).unwrap();
    let loaded = catalog.get("extra_autocommit").unwrap();

    let report = ContentionScheduler::new(config.clone()).simulate(loaded).unwrap();
    assert_report_sound(&report);
    assert!(report.is_recoverable());
    assert_eq!(report.connection("a").unwrap().status, TerminalStatus::Succeeded);
    assert_eq!(report.committed_rows(), 2);
}

#[test]
fn configured_timeout_applies_when_scenario_has_none() {
    let scenario = Scenario::new(
        "sleepy",
        vec![ConnectionSpec::new(
            "a",
            vec![
                Step::Begin {
                    mode: TransactionMode::Deferred,
                },
                Step::read(),
                Step::Sleep { ms: 60_000 },
                Step::Commit,
            ],
        )],
    );
    let config = LockstepConfig {
        run_timeout_ms: 100,
        ..LockstepConfig::default()
    };

    let report = with_timeout(Duration::from_secs(10), move || {
        ContentionScheduler::new(config).simulate(&scenario).unwrap()
    })
    .expect("run timeout did not fire");

    assert!(report.timed_out);
    assert_eq!(report.verdict(), VerdictKind::PermanentlyLocked);
    assert_eq!(report.connection("a").unwrap().status, TerminalStatus::Locked);
    assert_eq!(report.holders(), vec!["a".to_string()]);
}
