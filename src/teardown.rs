//! Teardown step reporting
//!
//! Cascading deletes are best-effort: every step runs even when an earlier
//! one failed, so a partially-broken topology never blocks further cleanup.
//! Each step's outcome is recorded so callers and tests can see exactly what
//! was and was not cleaned up.

use crate::error::Result;
use crate::exec::CmdOutput;
use tracing::warn;

/// Outcome of one teardown step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(String),
    Skipped,
}

/// One named teardown step and its outcome
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub outcome: Outcome,
}

/// Ordered record of a cascading teardown
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<Step>,
}

impl TeardownReport {
    /// Record the result of a step, logging a warning on failure
    pub fn record<T>(&mut self, name: impl Into<String>, result: Result<T>) {
        let name = name.into();
        let outcome = match result {
            Ok(_) => Outcome::Done,
            Err(e) => {
                warn!(step = %name, error = %e, "teardown step failed");
                Outcome::Failed(e.to_string())
            }
        };
        self.steps.push(Step { name, outcome });
    }

    /// Record a best-effort command, treating a non-zero exit as a failure
    /// even though it did not abort the teardown
    pub fn record_cmd(&mut self, name: impl Into<String>, result: Result<CmdOutput>) {
        let name = name.into();
        let outcome = match result {
            Ok(out) if out.success() => Outcome::Done,
            Ok(out) => {
                let message = out.stderr.trim().to_string();
                warn!(step = %name, error = %message, "teardown step failed");
                Outcome::Failed(message)
            }
            Err(e) => {
                warn!(step = %name, error = %e, "teardown step failed");
                Outcome::Failed(e.to_string())
            }
        };
        self.steps.push(Step { name, outcome });
    }

    /// Record a step that did not apply (e.g. object already absent)
    pub fn skip(&mut self, name: impl Into<String>) {
        self.steps.push(Step {
            name: name.into(),
            outcome: Outcome::Skipped,
        });
    }

    /// True when no step failed
    pub fn is_clean(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|s| matches!(s.outcome, Outcome::Failed(_)))
    }

    /// The names of all failed steps
    pub fn failures(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, Outcome::Failed(_)))
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_report_aggregation() {
        let mut report = TeardownReport::default();
        report.record("delete veth", Ok(()));
        report.record(
            "delete namespace",
            Err::<(), _>(Error::CommandFailed {
                command: "ip netns del x".to_string(),
                message: "busy".to_string(),
            }),
        );
        report.skip("remove masquerade");

        assert!(!report.is_clean());
        assert_eq!(report.failures(), vec!["delete namespace"]);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[2].outcome, Outcome::Skipped);
    }

    #[test]
    fn test_record_cmd_flags_nonzero_exit() {
        let mut report = TeardownReport::default();
        report.record_cmd(
            "delete veth",
            Ok(CmdOutput {
                status: 1,
                stdout: String::new(),
                stderr: "Cannot find device".to_string(),
            }),
        );
        assert!(!report.is_clean());
        assert_eq!(report.steps[0].outcome, Outcome::Failed("Cannot find device".to_string()));
    }

    #[test]
    fn test_clean_report() {
        let mut report = TeardownReport::default();
        report.record("delete bridge", Ok(()));
        assert!(report.is_clean());
        assert!(report.failures().is_empty());
    }
}
