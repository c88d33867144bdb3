//! External reasoner boundary for configuration evolution.
//!
//! The reasoner sees recent run history and proposes ONE typed parameter
//! delta with a short justification. It is rate-limited, so every call
//! goes through a single backoff-aware gate shared across concurrent
//! evolution loops; exhaustion falls back to "keep current configuration".
//! Evolution is best-effort, never load-bearing for correctness.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use engine::core::action::salvage_json;
use engine::core::params::{EngineParams, ParamDelta};
use engine::io::process::run_command_with_timeout;
use engine::io::retry::{RetryGate, RetryOutcome};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::store::RunRecord;

/// What the reasoner is shown: the configuration in force and recent run
/// history for the scope — never the full corpus.
#[derive(Debug)]
pub struct ReasonerContext<'a> {
    pub scope: &'a str,
    pub params: &'a EngineParams,
    pub recent: &'a [RunRecord],
}

/// Abstraction over reasoner backends.
pub trait Reasoner {
    fn propose_delta(&self, context: &ReasonerContext<'_>) -> Result<ParamDelta>;
}

/// Reasoner that spawns a configured CLI, in the same style as the
/// inference provider: prompt on stdin, JSON reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Reasoner for CommandReasoner {
    fn propose_delta(&self, context: &ReasonerContext<'_>) -> Result<ParamDelta> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoner command must be non-empty"))?;
        let prompt = build_reasoner_prompt(context);

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            None,
        )
        .context("run reasoner")?;

        if output.timed_out {
            bail!("reasoner timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!("reasoner failed with status {:?}", output.status.code());
        }
        parse_delta(&output.stdout_lossy())
    }
}

/// Render the evolution prompt: current parameters, recent outcomes, and
/// the guardrail constraints the proposal must respect.
pub fn build_reasoner_prompt(context: &ReasonerContext<'_>) -> String {
    let runs_text = if context.recent.is_empty() {
        "- (no runs recorded yet)".to_string()
    } else {
        context
            .recent
            .iter()
            .map(|run| {
                format!(
                    "- score {}, {}, progress {:.2}, {} turns{}",
                    run.score,
                    if run.passed { "passed" } else { "failed" },
                    run.progress,
                    run.turns,
                    run.fail_reason
                        .as_deref()
                        .map(|reason| format!(" ({reason})"))
                        .unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let params = context.params;

    format!(
        r#"You are tuning a task-solving engine. Propose at most ONE small change
to its configuration, based on recent run outcomes.

Scope: {scope}

Current configuration (version {version}):
- max_turns: {max_turns}
- verify_retry_limit: {verify_retry_limit}
- sample_width: {sample_width}
- base_temperature: {base_temperature}
- temperature_step: {temperature_step}
- ledger_window: {ledger_window}
- use_hints: {use_hints}
- guardrail_slack: {guardrail_slack}

Recent runs (newest first):
{runs_text}

Constraints: changes must be incremental. Numeric parameters may only move
a small step from their current value and stay inside fixed floors and
ceilings; oversized proposals are rejected and the configuration stays as
it is.

Return JSON with this exact structure:
{{
  "changes": {{"max_turns": 30}},
  "reasoning": "why this change should raise the score"
}}

Only include the fields you want to change. Return an empty "changes"
object to keep the current configuration."#,
        scope = context.scope,
        version = params.version,
        max_turns = params.max_turns,
        verify_retry_limit = params.verify_retry_limit,
        sample_width = params.sample_width,
        base_temperature = params.base_temperature,
        temperature_step = params.temperature_step,
        ledger_window = params.ledger_window,
        use_hints = params.use_hints,
        guardrail_slack = params.guardrail_slack,
    )
}

/// Parse a reasoner reply into a typed delta, tolerating markdown fences.
pub fn parse_delta(raw: &str) -> Result<ParamDelta> {
    let value: Value = match serde_json::from_str(raw.trim()) {
        Ok(value) => value,
        Err(_) => salvage_json(raw).ok_or_else(|| anyhow!("unparseable reasoner reply"))?,
    };
    let changes = value.get("changes").cloned().unwrap_or(Value::Null);
    let mut delta: ParamDelta = if changes.is_null() {
        ParamDelta::default()
    } else {
        serde_json::from_value(changes).context("parse proposed changes")?
    };
    delta.reasoning = value
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or("no reasoning provided")
        .to_string();
    Ok(delta)
}

/// The shared, backoff-aware access gate for the reasoner endpoint.
///
/// Concurrent evolution loops must all call through one instance so the
/// rate-limited endpoint sees one serialized client instead of N
/// independent ones.
pub struct ReasonerGate {
    lock: Mutex<()>,
    retry: RetryGate,
}

impl ReasonerGate {
    pub fn new(retry: RetryGate) -> Self {
        Self {
            lock: Mutex::new(()),
            retry,
        }
    }

    /// Ask for one proposal. `None` means the endpoint stayed unavailable
    /// through the backoff schedule and the caller keeps the current
    /// configuration.
    pub fn propose<R: Reasoner>(
        &self,
        reasoner: &R,
        context: &ReasonerContext<'_>,
    ) -> Option<ParamDelta> {
        let _serialized = self.lock.lock().expect("reasoner gate lock");
        match self
            .retry
            .run("reasoner", || reasoner.propose_delta(context))
        {
            RetryOutcome::Completed(delta) => {
                debug!("reasoner proposed a delta");
                Some(delta)
            }
            RetryOutcome::Exhausted { attempts, last_error } => {
                warn!(attempts, err = %last_error, "reasoner unavailable, keeping current configuration");
                info!("evolution falls back to no change");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with<'a>(
        params: &'a EngineParams,
        recent: &'a [RunRecord],
    ) -> ReasonerContext<'a> {
        ReasonerContext {
            scope: "global",
            params,
            recent,
        }
    }

    #[test]
    fn prompt_names_parameters_and_runs() {
        let params = EngineParams::default();
        let runs = vec![RunRecord {
            id: 1,
            run_id: "run-1".to_string(),
            scope: "global".to_string(),
            task_id: "t".to_string(),
            config_id: 1,
            passed: false,
            progress: 0.4,
            turns: 24,
            duration_ms: 1000,
            resource_units: 500,
            fail_reason: Some("verify-exhausted".to_string()),
            score: 76,
            created_at: String::new(),
        }];
        let prompt = build_reasoner_prompt(&context_with(&params, &runs));
        assert!(prompt.contains("max_turns: 24"));
        assert!(prompt.contains("score 76"));
        assert!(prompt.contains("verify-exhausted"));
        assert!(prompt.contains("ONE small change"));
    }

    #[test]
    fn parses_clean_delta() {
        let delta = parse_delta(
            r#"{"changes": {"sample_width": 3}, "reasoning": "parallel candidates help"}"#,
        )
        .expect("parse");
        assert_eq!(delta.sample_width, Some(3));
        assert_eq!(delta.reasoning, "parallel candidates help");
    }

    #[test]
    fn parses_fenced_delta() {
        let raw = "Analysis...\n```json\n{\"changes\": {}, \"reasoning\": \"keep\"}\n```";
        let delta = parse_delta(raw).expect("parse");
        assert!(delta.is_empty());
        assert_eq!(delta.reasoning, "keep");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_delta("the configuration seems fine").is_err());
    }

    #[test]
    fn gate_falls_back_to_none_on_exhaustion() {
        struct DownReasoner;
        impl Reasoner for DownReasoner {
            fn propose_delta(&self, _context: &ReasonerContext<'_>) -> Result<ParamDelta> {
                bail!("rate limited")
            }
        }
        let gate = ReasonerGate::new(RetryGate::immediate(2));
        let params = EngineParams::default();
        assert!(gate.propose(&DownReasoner, &context_with(&params, &[])).is_none());
    }

    #[test]
    fn gate_returns_proposals_when_available() {
        struct UpReasoner;
        impl Reasoner for UpReasoner {
            fn propose_delta(&self, _context: &ReasonerContext<'_>) -> Result<ParamDelta> {
                Ok(ParamDelta {
                    max_turns: Some(30),
                    reasoning: "more budget".to_string(),
                    ..ParamDelta::default()
                })
            }
        }
        let gate = ReasonerGate::new(RetryGate::immediate(2));
        let params = EngineParams::default();
        let delta = gate
            .propose(&UpReasoner, &context_with(&params, &[]))
            .expect("delta");
        assert_eq!(delta.max_turns, Some(30));
    }
}
