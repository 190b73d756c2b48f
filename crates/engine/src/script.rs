//! Connection scripts
//!
//! A script is the ordered list of statements one connection issues during a
//! run. Scripts are data: they deserialize from JSON so new scenarios never
//! need engine changes.
//!
//! ```json
//! [
//!   {"op": "begin", "mode": "deferred"},
//!   {"op": "read", "table": "users"},
//!   {"op": "sleep", "ms": 100},
//!   {"op": "write", "table": "users"},
//!   {"op": "commit"}
//! ]
//! ```

use lockstep_core::TransactionMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Table used when a step does not name one
pub const DEFAULT_TABLE: &str = "users";

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

// ============================================================================
// Steps
// ============================================================================

/// One scripted statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// `BEGIN <mode>`
    Begin {
        /// Locking behaviour of the transaction
        #[serde(default)]
        mode: TransactionMode,
    },
    /// `SELECT` from a table
    Read {
        /// Table to read
        #[serde(default = "default_table")]
        table: String,
    },
    /// `INSERT` one row into a table
    Write {
        /// Table to write
        #[serde(default = "default_table")]
        table: String,
        /// Top-level retry, only for writes outside an explicit transaction
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetrySetting>,
    },
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
    /// Deterministic delay used to force an interleaving
    Sleep {
        /// Milliseconds to sleep
        ms: u64,
    },
}

impl Step {
    /// Read of the default table
    pub fn read() -> Self {
        Step::Read {
            table: default_table(),
        }
    }

    /// Write to the default table, no retry
    pub fn write() -> Self {
        Step::Write {
            table: default_table(),
            retry: None,
        }
    }

    /// True for `Commit` and `Rollback`, the steps that end a transaction
    pub fn ends_transaction(&self) -> bool {
        matches!(self, Step::Commit | Step::Rollback)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Begin { mode } => write!(f, "BEGIN {}", mode),
            Step::Read { table } => write!(f, "READ {}", table),
            Step::Write { table, .. } => write!(f, "WRITE {}", table),
            Step::Commit => f.write_str("COMMIT"),
            Step::Rollback => f.write_str("ROLLBACK"),
            Step::Sleep { ms } => write!(f, "SLEEP {}ms", ms),
        }
    }
}

// ============================================================================
// Failure policy
// ============================================================================

/// What a runner does after a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip forward to the next `Commit` or `Rollback` (commit in `finally`)
    #[default]
    SkipToCommit,
    /// Carry on with the next step
    Continue,
    /// Stop the script where it is, holding whatever it holds
    Abandon,
}

// ============================================================================
// Retry
// ============================================================================

/// Top-level retry with exponential backoff
///
/// Only ever applied to a write issued outside an explicit transaction, and
/// only after the failed attempt has unwound every lock it took.
///
/// # Example
/// ```ignore
/// let policy = RetryPolicy::new()
///     .with_max_retries(5)
///     .with_base_delay_ms(20)
///     .with_max_delay_ms(400);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1600,
        }
    }
}

impl RetryPolicy {
    /// Create a RetryPolicy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryPolicy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay after the given failed attempt (0-based): `base * 2^attempt`,
    /// capped at `max_delay_ms`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        // Cap the shift to prevent overflow (1 << 63 is the max for u64)
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// How a write asks for retry
///
/// `"retry": true` uses the configured default policy, an object spells the
/// policy out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySetting {
    /// `true` for the default policy, `false` for none
    Enabled(bool),
    /// Explicit policy
    Policy(RetryPolicy),
}

impl RetrySetting {
    /// Policy to apply, given the configured default
    pub fn resolve(&self, default: &RetryPolicy) -> Option<RetryPolicy> {
        match self {
            RetrySetting::Enabled(true) => Some(*default),
            RetrySetting::Enabled(false) => None,
            RetrySetting::Policy(policy) => Some(*policy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_json_shapes() {
        let steps: Vec<Step> = serde_json::from_str(
            r#"[
                {"op": "begin"},
                {"op": "begin", "mode": "immediate"},
                {"op": "read"},
                {"op": "write", "table": "profiles"},
                {"op": "write", "retry": true},
                {"op": "write", "retry": {"max_retries": 2, "base_delay_ms": 5, "max_delay_ms": 10}},
                {"op": "commit"},
                {"op": "rollback"},
                {"op": "sleep", "ms": 50}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            steps[0],
            Step::Begin {
                mode: TransactionMode::Deferred
            }
        );
        assert_eq!(
            steps[1],
            Step::Begin {
                mode: TransactionMode::Immediate
            }
        );
        assert_eq!(steps[2], Step::read());
        assert_eq!(steps[3].to_string(), "WRITE profiles");
        assert!(matches!(
            steps[4],
            Step::Write {
                retry: Some(RetrySetting::Enabled(true)),
                ..
            }
        ));
        assert!(matches!(
            steps[5],
            Step::Write {
                retry: Some(RetrySetting::Policy(RetryPolicy { max_retries: 2, .. })),
                ..
            }
        ));
        assert!(steps[6].ends_transaction());
        assert!(steps[7].ends_transaction());
        assert_eq!(steps[8], Step::Sleep { ms: 50 });
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(serde_json::from_str::<Step>(r#"{"op": "vacuum"}"#).is_err());
    }

    #[test]
    fn test_step_display() {
        assert_eq!(
            Step::Begin {
                mode: TransactionMode::Exclusive
            }
            .to_string(),
            "BEGIN EXCLUSIVE"
        );
        assert_eq!(Step::read().to_string(), "READ users");
        assert_eq!(Step::Sleep { ms: 10 }.to_string(), "SLEEP 10ms");
    }

    #[test]
    fn test_failure_policy_default() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::SkipToCommit);
        let policy: FailurePolicy = serde_json::from_str("\"abandon\"").unwrap();
        assert_eq!(policy, FailurePolicy::Abandon);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(10)
            .with_max_delay_ms(1000);
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(10));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(20));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(40));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(80));
    }

    #[test]
    fn test_calculate_delay_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(250);
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(250));
        // No overflow at absurd attempt counts
        assert_eq!(policy.calculate_delay(200), Duration::from_millis(250));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.base_delay_ms, RetryPolicy::default().base_delay_ms);
    }

    #[test]
    fn test_retry_setting_resolve() {
        let default = RetryPolicy::new().with_max_retries(7);
        assert_eq!(
            RetrySetting::Enabled(true).resolve(&default),
            Some(default)
        );
        assert_eq!(RetrySetting::Enabled(false).resolve(&default), None);
        let explicit = RetryPolicy::no_retry();
        assert_eq!(
            RetrySetting::Policy(explicit).resolve(&default),
            Some(explicit)
        );
    }
}
