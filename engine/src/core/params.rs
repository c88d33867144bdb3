//! Tunable engine parameters and the guardrails that bound their evolution.
//!
//! A parameter set is immutable once persisted; the evolution controller
//! produces new versions by applying a typed [`ParamDelta`]. Guardrail
//! validation is a pure function over (current, delta) so it is testable
//! without any external dependency.

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-9;

/// The engine's tunable parameter bag.
///
/// Every numeric parameter has a hard floor and ceiling in [`Guardrails`];
/// `guardrail_slack` widens the per-step delta bands and is itself an
/// evolvable parameter, which is how the system resolves the
/// frozen-configuration failure mode without a fixed policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineParams {
    /// Semantic version of this parameter set.
    pub version: String,
    /// Global turn budget for one run.
    pub max_turns: u32,
    /// Failed done-signal verifications tolerated before the run fails.
    pub verify_retry_limit: u32,
    /// Candidates generated per decision point (1 disables sampling).
    pub sample_width: u32,
    /// Temperature of the first candidate on the ladder.
    pub base_temperature: f64,
    /// Temperature increment between ladder rungs.
    pub temperature_step: f64,
    /// Step summaries rendered into each prompt.
    pub ledger_window: u32,
    /// Whether reference-approach hints are injected into prompts.
    pub use_hints: bool,
    /// Free-text hint template shown when `use_hints` is set.
    pub hint: Option<String>,
    /// Multiplier on per-step delta bands during guardrail validation.
    pub guardrail_slack: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            max_turns: 24,
            verify_retry_limit: 2,
            sample_width: 1,
            base_temperature: 0.2,
            temperature_step: 0.25,
            ledger_window: 3,
            use_hints: false,
            hint: None,
            guardrail_slack: 1.0,
        }
    }
}

impl EngineParams {
    /// Canonical JSON used for content hashing and identity comparison.
    /// Field order is the struct declaration order, so the rendering is
    /// deterministic.
    pub fn canonical_json(&self) -> String {
        let mut hashed = self.clone();
        // Version is bookkeeping, not identity: two versions with identical
        // parameters are the same configuration.
        hashed.version = String::new();
        serde_json::to_string(&hashed).expect("params serialize to json")
    }

    /// True when the two parameter sets are identical ignoring version.
    pub fn same_parameters(&self, other: &EngineParams) -> bool {
        self.canonical_json() == other.canonical_json()
    }
}

/// A proposed change: one optional new value per tunable parameter, plus
/// the reasoning that justified it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamDelta {
    pub max_turns: Option<u32>,
    pub verify_retry_limit: Option<u32>,
    pub sample_width: Option<u32>,
    pub base_temperature: Option<f64>,
    pub temperature_step: Option<f64>,
    pub ledger_window: Option<u32>,
    pub use_hints: Option<bool>,
    pub hint: Option<String>,
    pub guardrail_slack: Option<f64>,
    pub reasoning: String,
}

impl ParamDelta {
    pub fn is_empty(&self) -> bool {
        self.max_turns.is_none()
            && self.verify_retry_limit.is_none()
            && self.sample_width.is_none()
            && self.base_temperature.is_none()
            && self.temperature_step.is_none()
            && self.ledger_window.is_none()
            && self.use_hints.is_none()
            && self.hint.is_none()
            && self.guardrail_slack.is_none()
    }
}

/// Hard floors/ceilings and per-step delta caps for every numeric
/// parameter.
#[derive(Debug, Clone)]
pub struct Guardrails {
    pub max_turns_range: (u32, u32),
    pub max_turns_step: u32,
    pub verify_retry_range: (u32, u32),
    pub verify_retry_step: u32,
    pub sample_width_range: (u32, u32),
    pub sample_width_step: u32,
    pub temperature_range: (f64, f64),
    pub temperature_step_cap: f64,
    pub ledger_window_range: (u32, u32),
    pub ledger_window_step: u32,
    pub slack_range: (f64, f64),
    pub slack_step_cap: f64,
    pub hint_max_chars: usize,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_turns_range: (4, 80),
            max_turns_step: 8,
            verify_retry_range: (0, 5),
            verify_retry_step: 1,
            sample_width_range: (1, 8),
            sample_width_step: 2,
            temperature_range: (0.0, 1.2),
            temperature_step_cap: 0.15,
            ledger_window_range: (1, 10),
            ledger_window_step: 2,
            slack_range: (0.5, 3.0),
            slack_step_cap: 0.5,
            hint_max_chars: 400,
        }
    }
}

/// Validate a proposed delta against the guardrails.
///
/// Returns the list of violations; an empty list means the delta is
/// acceptable. Per-step caps are multiplied by the *current*
/// `guardrail_slack` (the slack parameter's own step cap is never scaled,
/// so slack cannot bootstrap itself).
pub fn validate_delta(
    current: &EngineParams,
    delta: &ParamDelta,
    guardrails: &Guardrails,
) -> Vec<String> {
    let mut errors = Vec::new();
    let slack = current
        .guardrail_slack
        .clamp(guardrails.slack_range.0, guardrails.slack_range.1);

    if delta.is_empty() {
        errors.push("proposal changes nothing".to_string());
        return errors;
    }
    let applied = apply_delta(current, delta);
    if applied.same_parameters(current) {
        errors.push("proposal is identical to the current configuration".to_string());
        return errors;
    }

    check_u32(
        &mut errors,
        "max_turns",
        current.max_turns,
        delta.max_turns,
        guardrails.max_turns_range,
        scaled_step(guardrails.max_turns_step, slack),
    );
    check_u32(
        &mut errors,
        "verify_retry_limit",
        current.verify_retry_limit,
        delta.verify_retry_limit,
        guardrails.verify_retry_range,
        scaled_step(guardrails.verify_retry_step, slack),
    );
    check_u32(
        &mut errors,
        "sample_width",
        current.sample_width,
        delta.sample_width,
        guardrails.sample_width_range,
        scaled_step(guardrails.sample_width_step, slack),
    );
    check_f64(
        &mut errors,
        "base_temperature",
        current.base_temperature,
        delta.base_temperature,
        guardrails.temperature_range,
        guardrails.temperature_step_cap * slack,
    );
    check_f64(
        &mut errors,
        "temperature_step",
        current.temperature_step,
        delta.temperature_step,
        (0.0, 0.5),
        guardrails.temperature_step_cap * slack,
    );
    check_u32(
        &mut errors,
        "ledger_window",
        current.ledger_window,
        delta.ledger_window,
        guardrails.ledger_window_range,
        scaled_step(guardrails.ledger_window_step, slack),
    );
    check_f64(
        &mut errors,
        "guardrail_slack",
        current.guardrail_slack,
        delta.guardrail_slack,
        guardrails.slack_range,
        guardrails.slack_step_cap,
    );
    if let Some(hint) = &delta.hint
        && hint.chars().count() > guardrails.hint_max_chars
    {
        errors.push(format!(
            "hint too long: {} chars > {}",
            hint.chars().count(),
            guardrails.hint_max_chars
        ));
    }
    errors
}

/// Apply a delta, producing the successor parameter set with a bumped
/// patch version. Validation is the caller's responsibility.
pub fn apply_delta(current: &EngineParams, delta: &ParamDelta) -> EngineParams {
    EngineParams {
        version: increment_version(&current.version),
        max_turns: delta.max_turns.unwrap_or(current.max_turns),
        verify_retry_limit: delta.verify_retry_limit.unwrap_or(current.verify_retry_limit),
        sample_width: delta.sample_width.unwrap_or(current.sample_width),
        base_temperature: delta.base_temperature.unwrap_or(current.base_temperature),
        temperature_step: delta.temperature_step.unwrap_or(current.temperature_step),
        ledger_window: delta.ledger_window.unwrap_or(current.ledger_window),
        use_hints: delta.use_hints.unwrap_or(current.use_hints),
        hint: delta.hint.clone().or_else(|| current.hint.clone()),
        guardrail_slack: delta.guardrail_slack.unwrap_or(current.guardrail_slack),
    }
}

/// Increment the patch component of a semantic version string.
pub fn increment_version(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() == 3
        && let Ok(patch) = parts[2].parse::<u32>()
    {
        return format!("{}.{}.{}", parts[0], parts[1], patch + 1);
    }
    version.to_string()
}

fn scaled_step(step: u32, slack: f64) -> u32 {
    ((f64::from(step) * slack).floor() as u32).max(1)
}

fn check_u32(
    errors: &mut Vec<String>,
    name: &str,
    current: u32,
    proposed: Option<u32>,
    (floor, ceiling): (u32, u32),
    max_step: u32,
) {
    let Some(value) = proposed else { return };
    if value < floor || value > ceiling {
        errors.push(format!("{name} out of bounds: {value} not in [{floor}, {ceiling}]"));
    }
    let step = value.abs_diff(current);
    if step > max_step {
        errors.push(format!("{name} change too large: {step} > {max_step} per step"));
    }
}

fn check_f64(
    errors: &mut Vec<String>,
    name: &str,
    current: f64,
    proposed: Option<f64>,
    (floor, ceiling): (f64, f64),
    max_step: f64,
) {
    let Some(value) = proposed else { return };
    if value < floor - EPSILON || value > ceiling + EPSILON {
        errors.push(format!(
            "{name} out of bounds: {value:.3} not in [{floor:.2}, {ceiling:.2}]"
        ));
    }
    let step = (value - current).abs();
    if step > max_step + EPSILON {
        errors.push(format!(
            "{name} change too large: {step:.3} > {max_step:.3} per step"
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_delta_passes() {
        let current = EngineParams::default();
        let delta = ParamDelta {
            base_temperature: Some(0.3),
            reasoning: "more diversity".to_string(),
            ..ParamDelta::default()
        };
        assert!(validate_delta(&current, &delta, &Guardrails::default()).is_empty());
    }

    #[test]
    fn oversized_step_is_rejected_with_reason() {
        let current = EngineParams::default();
        let delta = ParamDelta {
            max_turns: Some(current.max_turns + 20),
            reasoning: "much more budget".to_string(),
            ..ParamDelta::default()
        };
        let errors = validate_delta(&current, &delta, &Guardrails::default());
        assert!(errors.iter().any(|e| e.contains("max_turns change too large")));
    }

    #[test]
    fn hard_bounds_are_enforced() {
        let current = EngineParams {
            sample_width: 7,
            ..EngineParams::default()
        };
        let delta = ParamDelta {
            sample_width: Some(9),
            reasoning: "wider".to_string(),
            ..ParamDelta::default()
        };
        let errors = validate_delta(&current, &delta, &Guardrails::default());
        assert!(errors.iter().any(|e| e.contains("sample_width out of bounds")));
    }

    #[test]
    fn identical_proposal_is_rejected() {
        let current = EngineParams::default();
        let delta = ParamDelta {
            max_turns: Some(current.max_turns),
            reasoning: "same".to_string(),
            ..ParamDelta::default()
        };
        let errors = validate_delta(&current, &delta, &Guardrails::default());
        assert!(errors.iter().any(|e| e.contains("identical")));

        let empty = ParamDelta::default();
        let errors = validate_delta(&current, &empty, &Guardrails::default());
        assert!(errors.iter().any(|e| e.contains("changes nothing")));
    }

    #[test]
    fn slack_widens_step_bands_but_not_its_own() {
        let mut current = EngineParams::default();
        current.guardrail_slack = 2.0;
        let delta = ParamDelta {
            max_turns: Some(current.max_turns + 16),
            reasoning: "bigger jump under slack".to_string(),
            ..ParamDelta::default()
        };
        // 16 > base step 8 but within 8 * slack 2.0.
        assert!(validate_delta(&current, &delta, &Guardrails::default()).is_empty());

        let slack_jump = ParamDelta {
            guardrail_slack: Some(3.0),
            reasoning: "open the floodgates".to_string(),
            ..ParamDelta::default()
        };
        let errors = validate_delta(&current, &slack_jump, &Guardrails::default());
        assert!(errors.iter().any(|e| e.contains("guardrail_slack change too large")));
    }

    #[test]
    fn apply_bumps_patch_version_and_merges() {
        let current = EngineParams::default();
        let delta = ParamDelta {
            sample_width: Some(3),
            reasoning: "sample more".to_string(),
            ..ParamDelta::default()
        };
        let next = apply_delta(&current, &delta);
        assert_eq!(next.version, "1.0.1");
        assert_eq!(next.sample_width, 3);
        assert_eq!(next.max_turns, current.max_turns);
    }

    #[test]
    fn increment_version_handles_malformed_strings() {
        assert_eq!(increment_version("1.0.0"), "1.0.1");
        assert_eq!(increment_version("2.0.99"), "2.0.100");
        assert_eq!(increment_version("weird"), "weird");
    }

    #[test]
    fn canonical_json_ignores_version() {
        let a = EngineParams::default();
        let mut b = EngineParams::default();
        b.version = "9.9.9".to_string();
        assert!(a.same_parameters(&b));
        b.max_turns += 1;
        assert!(!a.same_parameters(&b));
    }
}
