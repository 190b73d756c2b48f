//! Randomized scripts through the full scheduler
//!
//! Whatever the interleaving, every recorded snapshot is a legal lock state,
//! the verdict agrees with the connections' final locks, and teardown clears
//! every database.

use crate::common::*;
use lockstep::{CacheMode, FailurePolicy, TransactionMode};
use proptest::prelude::*;

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        prop_oneof![
            Just(TransactionMode::Deferred),
            Just(TransactionMode::Immediate),
            Just(TransactionMode::Exclusive),
        ]
        .prop_map(|mode| Step::Begin { mode }),
        prop_oneof![Just("users"), Just("orders")].prop_map(|t| Step::Read {
            table: t.to_string()
        }),
        prop_oneof![Just("users"), Just("orders")].prop_map(|t| Step::Write {
            table: t.to_string(),
            retry: None,
        }),
        Just(Step::Commit),
        Just(Step::Rollback),
        (0u64..3).prop_map(|ms| Step::Sleep { ms }),
    ]
}

fn connection_strategy(index: usize) -> impl Strategy<Value = ConnectionSpec> {
    (
        prop::collection::vec(step_strategy(), 1..8),
        prop_oneof![
            Just(FailurePolicy::SkipToCommit),
            Just(FailurePolicy::Continue),
            Just(FailurePolicy::Abandon),
        ],
        prop_oneof![Just(CacheMode::Private), Just(CacheMode::Shared)],
    )
        .prop_map(move |(steps, on_failure, cache)| {
            ConnectionSpec::new(format!("c{}", index), steps)
                .with_failure_policy(on_failure)
                .with_cache(cache)
        })
}

fn scenario_strategy() -> impl Strategy<Value = Scenario> {
    (
        connection_strategy(0),
        connection_strategy(1),
        prop::option::of(connection_strategy(2)),
    )
        .prop_map(|(a, b, c)| {
            let mut connections = vec![a, b];
            connections.extend(c);
            Scenario::new("random", connections).with_timeout_ms(5_000)
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_scripts_keep_lock_invariants(scenario in scenario_strategy()) {
        let run = run(&scenario);
        let report = run.report().clone();
        assert_report_sound(&report);

        prop_assert!(!report.timed_out);

        let locked: Vec<&str> = report
            .connections
            .iter()
            .filter(|c| c.status == TerminalStatus::Locked)
            .map(|c| c.name.as_str())
            .collect();
        prop_assert_eq!(report.is_recoverable(), locked.is_empty());
        let mut holders = report.holders();
        holders.sort();
        prop_assert_eq!(holders, locked.iter().map(|s| s.to_string()).collect::<Vec<_>>());

        let writes = scenario
            .connections
            .iter()
            .flat_map(|c| c.steps.iter())
            .filter(|s| matches!(s, Step::Write { .. }))
            .count() as u64;
        prop_assert!(report.committed_rows() <= writes);

        for (_, snapshot) in run.teardown() {
            prop_assert!(snapshot.is_unlocked());
        }
    }
}
