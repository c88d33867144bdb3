//! Verification verdicts, split structurally by provenance.
//!
//! The information boundary between self-generated and protected check
//! suites is enforced by the type system, not by scrubbing: a
//! [`ProtectedReport`] has no fields capable of holding expected values or
//! diffs, so nothing downstream can leak them into a prompt.

use serde::{Deserialize, Serialize};

/// Maximum failing-check names surfaced from a protected suite.
pub const MAX_PROTECTED_FAILING_NAMES: usize = 5;

/// Passing/total counts for one verification execution.
///
/// `total == 0` means the harness produced no parseable checks — a broken
/// verifier, which callers must treat differently from "ran and failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounts {
    pub passing: u32,
    pub total: u32,
}

impl CheckCounts {
    pub fn new(passing: u32, total: u32) -> Self {
        Self { passing, total }
    }

    /// Fraction of checks satisfied, 0.0 when no checks ran.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.passing) / f64::from(self.total)
        }
    }
}

/// One failing check from a self-generated suite. Full detail is permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub name: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Verification outcome for a self-generated suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfReport {
    pub passed: bool,
    pub counts: CheckCounts,
    pub failures: Vec<FailureDetail>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Verification outcome for a protected suite.
///
/// Carries pass/fail, counts, failing check names (capped), and one generic
/// feedback line. There is deliberately no field for expected values,
/// actual values, or per-check diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectedReport {
    pub passed: bool,
    pub counts: CheckCounts,
    pub failing_checks: Vec<String>,
    pub feedback: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl ProtectedReport {
    /// Build a report, capping the failing-check name list.
    pub fn new(
        passed: bool,
        counts: CheckCounts,
        mut failing_checks: Vec<String>,
        feedback: String,
        exit_code: Option<i32>,
        duration_ms: u64,
    ) -> Self {
        failing_checks.truncate(MAX_PROTECTED_FAILING_NAMES);
        Self {
            passed,
            counts,
            failing_checks,
            feedback,
            exit_code,
            duration_ms,
        }
    }
}

/// A verification result of either provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provenance", rename_all = "snake_case")]
pub enum Verdict {
    SelfChecked(SelfReport),
    Protected(ProtectedReport),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        match self {
            Verdict::SelfChecked(r) => r.passed,
            Verdict::Protected(r) => r.passed,
        }
    }

    pub fn counts(&self) -> CheckCounts {
        match self {
            Verdict::SelfChecked(r) => r.counts,
            Verdict::Protected(r) => r.counts,
        }
    }

    pub fn progress(&self) -> f64 {
        self.counts().progress()
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Verdict::SelfChecked(r) => r.duration_ms,
            Verdict::Protected(r) => r.duration_ms,
        }
    }

    /// The harness ran no checks at all: the verifier is broken, as opposed
    /// to the solution being wrong.
    pub fn harness_broken(&self) -> bool {
        !self.passed() && self.counts().total == 0
    }

    /// The only rendering of a verdict the prompt builder may embed.
    ///
    /// Self-checked reports include failure details; protected reports are
    /// limited to counts, names, and the generic feedback line.
    pub fn actor_feedback(&self) -> String {
        if self.harness_broken() {
            return "Verification harness failed to run (no checks executed).".to_string();
        }
        let counts = self.counts();
        match self {
            Verdict::SelfChecked(report) => {
                let mut buf = format!("{}/{} checks passing.", counts.passing, counts.total);
                for failure in report.failures.iter().take(3) {
                    buf.push_str(&format!("\n- {}: {}", failure.name, failure.message));
                    if let (Some(expected), Some(actual)) = (&failure.expected, &failure.actual) {
                        buf.push_str(&format!(" (expected {expected}, got {actual})"));
                    }
                }
                buf
            }
            Verdict::Protected(report) => {
                let mut buf = format!("{}/{} checks passing.", counts.passing, counts.total);
                if !report.failing_checks.is_empty() {
                    buf.push_str(&format!(
                        "\nFailing checks: {}",
                        report.failing_checks.join(", ")
                    ));
                }
                if !report.feedback.trim().is_empty() {
                    buf.push('\n');
                    buf.push_str(report.feedback.trim());
                }
                buf
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protected(passing: u32, total: u32) -> Verdict {
        Verdict::Protected(ProtectedReport::new(
            passing == total && total > 0,
            CheckCounts::new(passing, total),
            vec!["test_leading_zero".to_string()],
            "Some checks are failing.".to_string(),
            Some(1),
            10,
        ))
    }

    #[test]
    fn progress_is_zero_when_no_checks_ran() {
        assert_eq!(CheckCounts::new(0, 0).progress(), 0.0);
        assert!((CheckCounts::new(2, 5).progress() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn harness_broken_is_distinct_from_checks_failed() {
        let broken = Verdict::Protected(ProtectedReport::new(
            false,
            CheckCounts::new(0, 0),
            Vec::new(),
            String::new(),
            Some(2),
            5,
        ));
        assert!(broken.harness_broken());
        assert!(!protected(3, 10).harness_broken());
    }

    #[test]
    fn protected_feedback_contains_counts_and_names_only() {
        let feedback = protected(3, 10).actor_feedback();
        assert!(feedback.contains("3/10 checks passing"));
        assert!(feedback.contains("test_leading_zero"));
        assert!(!feedback.contains("expected"));
    }

    #[test]
    fn protected_report_serialization_carries_no_expected_values() {
        // The boundary is structural: assert the serialized form has no
        // field that could hold an expected value or diff.
        let json = serde_json::to_value(protected(3, 10)).expect("serialize");
        let report = json.as_object().expect("object");
        assert!(!report.contains_key("expected"));
        assert!(!report.contains_key("actual"));
        assert!(!report.contains_key("failures"));
        for name in report["failing_checks"].as_array().expect("array") {
            assert!(name.is_string());
        }
    }

    #[test]
    fn protected_failing_names_are_capped() {
        let names: Vec<String> = (0..20).map(|i| format!("check_{i}")).collect();
        let report = ProtectedReport::new(
            false,
            CheckCounts::new(0, 20),
            names,
            String::new(),
            Some(1),
            0,
        );
        assert_eq!(report.failing_checks.len(), MAX_PROTECTED_FAILING_NAMES);
    }

    #[test]
    fn self_checked_feedback_includes_detail() {
        let verdict = Verdict::SelfChecked(SelfReport {
            passed: false,
            counts: CheckCounts::new(1, 2),
            failures: vec![FailureDetail {
                name: "test_year".to_string(),
                message: "assertion failed".to_string(),
                expected: Some("[2024]".to_string()),
                actual: Some("[24]".to_string()),
            }],
            exit_code: Some(1),
            duration_ms: 3,
        });
        let feedback = verdict.actor_feedback();
        assert!(feedback.contains("1/2 checks passing"));
        assert!(feedback.contains("expected [2024], got [24]"));
    }
}
