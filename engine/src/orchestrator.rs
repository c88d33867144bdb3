//! Orchestration of one task attempt.
//!
//! Drives the actor through the decomposed subtask plan one turn at a
//! time, executes proposed actions against the authoritative workspace,
//! and gates every "looks done" signal behind the sandboxed verifier. A
//! done signal never ends the run by itself: only a passing verification
//! does, and failed gate verifications are bounded by the configured retry
//! limit.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::action::{Action, ParsedAction, parse_action};
use crate::core::decompose::{Subtask, decompose};
use crate::core::ledger::{StepDetail, StepLedger, StepRecord};
use crate::core::params::EngineParams;
use crate::core::task::TaskDefinition;
use crate::core::verify::Verdict;
use crate::io::process::run_command_with_timeout;
use crate::io::provider::{Provider, ProposeRequest};
use crate::io::retry::{RetryGate, RetryOutcome};
use crate::io::sandbox::{FatalSandboxError, Verifier};
use crate::io::workspace::{candidate_copy, remove_dir_best_effort, replace_dir};
use crate::prompt::{PromptBuilder, PromptInputs};
use crate::sampler::{RoundOutcome, run_round, temperature_ladder};

/// Identical action signatures treated as an implicit done signal.
const REPEAT_DONE_THRESHOLD: u32 = 3;

/// Options for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub params: EngineParams,
    /// Wall-clock budget for the whole run.
    pub wall_clock: Duration,
    pub prompt_budget_bytes: usize,
    pub max_tokens: u32,
    /// Timeout for one `run_command` action.
    pub action_timeout: Duration,
    pub action_output_limit_bytes: usize,
    /// Retry policy for inference calls; exhaustion fails the step only.
    pub provider_retry: RetryGate,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            params: EngineParams::default(),
            wall_clock: Duration::from_secs(30 * 60),
            prompt_budget_bytes: 40_000,
            max_tokens: 2048,
            action_timeout: Duration::from_secs(120),
            action_output_limit_bytes: 100_000,
            provider_retry: RetryGate::default(),
        }
    }
}

/// Reason a run ended without a verified pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    TurnBudgetExhausted,
    Timeout,
    VerifyExhausted,
    SandboxFatal,
    Cancelled,
}

impl FailReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailReason::TurnBudgetExhausted => "turn-budget-exhausted",
            FailReason::Timeout => "timeout",
            FailReason::VerifyExhausted => "verify-exhausted",
            FailReason::SandboxFatal => "sandbox-fatal",
            FailReason::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub passed: bool,
    /// Best verification progress observed during the run.
    pub progress: f64,
    pub turns: u32,
    pub duration_ms: u64,
    /// Rough inference usage: prompt + reply bytes / 4.
    pub resource_units: u64,
    pub fail_reason: Option<FailReason>,
    /// Full step history, independent of the bounded ledger window.
    pub history: Vec<StepRecord>,
    pub final_verdict: Option<Verdict>,
}

/// Per-run mutable state.
struct LoopState {
    ledger: StepLedger,
    turns: u32,
    verify_failures: u32,
    /// Signature of the last proposed action and its repeat count.
    repeat: Option<(String, u32)>,
    feedback: Option<String>,
    best_progress: f64,
    resource_units: u64,
    last_verdict: Option<Verdict>,
}

impl LoopState {
    fn observe_verdict(&mut self, verdict: &Verdict) {
        self.best_progress = self.best_progress.max(verdict.progress());
        self.feedback = Some(verdict.actor_feedback());
        self.last_verdict = Some(verdict.clone());
    }
}

/// What one turn decided about the run.
enum TurnOutcome {
    Continue,
    Passed,
    Failed(FailReason),
}

/// Drives one task attempt against one workspace.
pub struct Orchestrator<'a, P: Provider, V: Verifier> {
    provider: &'a P,
    verifier: &'a V,
    options: RunOptions,
}

impl<'a, P: Provider, V: Verifier> Orchestrator<'a, P, V> {
    pub fn new(provider: &'a P, verifier: &'a V, options: RunOptions) -> Self {
        Self {
            provider,
            verifier,
            options,
        }
    }

    /// Run the full loop for `task` against `workspace`.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn run(
        &self,
        task: &TaskDefinition,
        workspace: &Path,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        task.validate()?;
        let params = &self.options.params;
        let subtasks = decompose(task, params.max_turns);
        let hints = self.hints();
        let start = Instant::now();

        let mut state = LoopState {
            ledger: StepLedger::new(params.ledger_window as usize),
            turns: 0,
            verify_failures: 0,
            repeat: None,
            feedback: None,
            best_progress: 0.0,
            resource_units: 0,
            last_verdict: None,
        };

        info!(subtasks = subtasks.len(), max_turns = params.max_turns, "run started");

        for subtask in &subtasks {
            let mut subtask_turns = 0u32;
            while subtask_turns < subtask.turn_budget {
                if cancel.is_cancelled() {
                    return Ok(self.finish(state, start, Some(FailReason::Cancelled)));
                }
                if state.turns >= params.max_turns {
                    return Ok(self.finish(state, start, Some(FailReason::TurnBudgetExhausted)));
                }
                if start.elapsed() >= self.options.wall_clock {
                    return Ok(self.finish(state, start, Some(FailReason::Timeout)));
                }
                state.turns += 1;
                subtask_turns += 1;

                let prompt = self.build_prompt(subtask, task, &state, &hints);
                state.resource_units += prompt.len() as u64 / 4;

                let outcome = if params.sample_width > 1 {
                    self.sampled_turn(task, workspace, subtask, &prompt, &mut state, cancel)?
                } else {
                    self.direct_turn(task, workspace, &prompt, &mut state, cancel)?
                };
                match outcome {
                    TurnOutcome::Continue => {}
                    TurnOutcome::Passed => return Ok(self.finish(state, start, None)),
                    TurnOutcome::Failed(reason) => {
                        return Ok(self.finish(state, start, Some(reason)));
                    }
                }
            }
        }

        // Subtask budgets sum to the turn budget, so running out of plan is
        // the same hard stop.
        Ok(self.finish(state, start, Some(FailReason::TurnBudgetExhausted)))
    }

    fn hints(&self) -> Vec<String> {
        let params = &self.options.params;
        if params.use_hints
            && let Some(hint) = &params.hint
            && !hint.trim().is_empty()
        {
            return vec![hint.trim().to_string()];
        }
        Vec::new()
    }

    fn build_prompt(
        &self,
        subtask: &Subtask,
        task: &TaskDefinition,
        state: &LoopState,
        hints: &[String],
    ) -> String {
        let ledger = state.ledger.render();
        PromptBuilder::new(self.options.prompt_budget_bytes)
            .build_actor(&PromptInputs {
                subtask,
                task_description: &task.description,
                ledger: &ledger,
                feedback: state.feedback.as_deref(),
                hints,
            })
            .render()
    }

    /// One turn with sampling disabled: propose, execute, gate done signals.
    fn direct_turn(
        &self,
        task: &TaskDefinition,
        workspace: &Path,
        prompt: &str,
        state: &mut LoopState,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let request = ProposeRequest {
            prompt: prompt.to_string(),
            temperature: self.options.params.base_temperature,
            max_tokens: self.options.max_tokens,
        };
        let proposal = match self
            .options
            .provider_retry
            .run("inference", || self.provider.propose(&request))
        {
            RetryOutcome::Completed(proposal) => proposal,
            RetryOutcome::Exhausted { attempts, .. } => {
                warn!(attempts, "inference provider exhausted, failing step");
                state.ledger.record(
                    false,
                    &StepDetail::Note {
                        text: "inference provider unavailable".to_string(),
                    },
                );
                return Ok(TurnOutcome::Continue);
            }
        };
        state.resource_units += proposal.raw.len() as u64 / 4;

        let action = match parse_action(&proposal.action) {
            Ok(ParsedAction::Known(action)) => action,
            Ok(ParsedAction::Unrecognized { name }) => {
                state.ledger.record(false, &StepDetail::Rejected { name });
                return Ok(TurnOutcome::Continue);
            }
            Err(err) => {
                state.ledger.record(
                    false,
                    &StepDetail::Note {
                        text: format!("malformed action: {err}"),
                    },
                );
                return Ok(TurnOutcome::Continue);
            }
        };

        let done_signal = self.track_repeats(state, &action);

        match &action {
            Action::Verify => {
                let verdict = match self.gated_verify(task, workspace, cancel)? {
                    Some(verdict) => verdict,
                    None => return Ok(TurnOutcome::Failed(FailReason::SandboxFatal)),
                };
                self.record_verdict(state, &verdict);
                if verdict.passed() {
                    return Ok(TurnOutcome::Passed);
                }
                // A voluntary progress check is not a done claim; it does
                // not consume verify retries.
            }
            Action::Complete { summary } => {
                state.ledger.record(
                    true,
                    &StepDetail::Note {
                        text: if summary.trim().is_empty() {
                            "declared complete".to_string()
                        } else {
                            format!("declared complete: {}", summary.trim())
                        },
                    },
                );
            }
            other => {
                let (detail, success) = self.execute_workspace_action(other, workspace, cancel)?;
                state.ledger.record(success, &detail);
            }
        }

        if matches!(action, Action::Complete { .. }) || done_signal {
            return self.gate_done(task, workspace, state, cancel);
        }
        Ok(TurnOutcome::Continue)
    }

    /// One turn with sampling enabled: N candidates on isolated workspace
    /// copies, each verified, winner merged.
    fn sampled_turn(
        &self,
        task: &TaskDefinition,
        workspace: &Path,
        subtask: &Subtask,
        prompt: &str,
        state: &mut LoopState,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let params = &self.options.params;
        let ladder = temperature_ladder(
            params.sample_width,
            params.base_temperature,
            params.temperature_step,
        );
        debug!(width = ladder.len(), subtask = %subtask.id, "sampling round");
        let fatal: std::sync::Mutex<Option<String>> = std::sync::Mutex::new(None);

        let outcome = run_round(
            &ladder,
            |param| {
                let request = ProposeRequest {
                    prompt: prompt.to_string(),
                    temperature: param.temperature,
                    max_tokens: self.options.max_tokens,
                };
                let proposal = self.provider.propose(&request)?;
                let action = match parse_action(&proposal.action)? {
                    ParsedAction::Known(action) => action,
                    ParsedAction::Unrecognized { name } => {
                        return Err(anyhow!("unrecognized action '{name}'"));
                    }
                };
                let copy = candidate_copy(workspace, param.index)?;
                let (detail, success) = match &action {
                    // The round's own verification covers these.
                    Action::Verify => (
                        StepDetail::Note {
                            text: "requested verification".to_string(),
                        },
                        true,
                    ),
                    Action::Complete { .. } => (
                        StepDetail::Note {
                            text: "declared complete".to_string(),
                        },
                        true,
                    ),
                    other => self.execute_workspace_action(other, &copy, cancel)?,
                };
                let resource = proposal.raw.len() as u64 / 4;
                Ok((
                    TurnCandidate {
                        workspace: copy,
                        action,
                        detail,
                        success,
                    },
                    resource,
                ))
            },
            |candidate| {
                self.verifier
                    .verify(&candidate.workspace, task, cancel)
                    .map_err(|err| {
                        if let Some(fatal_err) = err.downcast_ref::<FatalSandboxError>() {
                            *fatal.lock().expect("fatal flag lock") =
                                Some(fatal_err.reason.clone());
                        }
                        err
                    })
            },
            cancel,
        );

        match outcome {
            RoundOutcome::Winner { winner, discarded } => {
                // Losers clean themselves up on drop and leave no trace in
                // the authoritative workspace.
                drop(discarded);
                replace_dir(workspace, &winner.candidate.workspace)
                    .context("merge winning candidate")?;

                state.resource_units += winner.resource_units;
                state
                    .ledger
                    .record(winner.candidate.success, &winner.candidate.detail);
                self.record_verdict(state, &winner.verdict);
                let done_signal = self.track_repeats(state, &winner.candidate.action)
                    || matches!(winner.candidate.action, Action::Complete { .. });

                if winner.verdict.passed() {
                    return Ok(TurnOutcome::Passed);
                }
                if done_signal {
                    // The winner's verdict already verified the merged
                    // state, so it stands in for the gate verification.
                    return Ok(self.absorb_gate_failure(state, &winner.verdict));
                }
                Ok(TurnOutcome::Continue)
            }
            RoundOutcome::AllFailed { attempted } => {
                if let Some(reason) = fatal.lock().expect("fatal flag lock").take() {
                    warn!(reason = %reason, "sampling round hit fatal sandbox error");
                    return Ok(TurnOutcome::Failed(FailReason::SandboxFatal));
                }
                state.ledger.record(
                    false,
                    &StepDetail::Note {
                        text: format!("sampling round failed ({attempted} candidates)"),
                    },
                );
                Ok(TurnOutcome::Continue)
            }
            RoundOutcome::Cancelled { discarded } => {
                drop(discarded);
                Ok(TurnOutcome::Failed(FailReason::Cancelled))
            }
        }
    }

    /// Track repeated identical proposals; returns true when the repeat
    /// threshold makes this turn an implicit done signal.
    fn track_repeats(&self, state: &mut LoopState, action: &Action) -> bool {
        let signature = action.signature();
        let count = match &state.repeat {
            Some((last, count)) if *last == signature => count + 1,
            _ => 1,
        };
        state.repeat = Some((signature, count));
        count >= REPEAT_DONE_THRESHOLD
    }

    /// Verify the authoritative workspace for a done signal and absorb the
    /// result.
    fn gate_done(
        &self,
        task: &TaskDefinition,
        workspace: &Path,
        state: &mut LoopState,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let verdict = match self.gated_verify(task, workspace, cancel)? {
            Some(verdict) => verdict,
            None => return Ok(TurnOutcome::Failed(FailReason::SandboxFatal)),
        };
        self.record_verdict(state, &verdict);
        if verdict.passed() {
            return Ok(TurnOutcome::Passed);
        }
        Ok(self.absorb_gate_failure(state, &verdict))
    }

    /// Shared failure handling for gate verifications: reset the repeat
    /// counter and enforce the retry limit. Broken-harness verdicts are
    /// sandbox trouble, not evidence about the solution, so they do not
    /// consume retries.
    fn absorb_gate_failure(&self, state: &mut LoopState, verdict: &Verdict) -> TurnOutcome {
        state.repeat = None;
        if verdict.harness_broken() {
            return TurnOutcome::Continue;
        }
        state.verify_failures += 1;
        debug!(
            verify_failures = state.verify_failures,
            limit = self.options.params.verify_retry_limit,
            "gate verification failed"
        );
        if state.verify_failures > self.options.params.verify_retry_limit {
            return TurnOutcome::Failed(FailReason::VerifyExhausted);
        }
        TurnOutcome::Continue
    }

    /// Run the verifier, separating fatal sandbox errors (None) from
    /// usable verdicts.
    fn gated_verify(
        &self,
        task: &TaskDefinition,
        workspace: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<Verdict>> {
        match self.verifier.verify(workspace, task, cancel) {
            Ok(verdict) => Ok(Some(verdict)),
            Err(err) => {
                if err.downcast_ref::<FatalSandboxError>().is_some() {
                    warn!(err = %err, "fatal sandbox error");
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    fn record_verdict(&self, state: &mut LoopState, verdict: &Verdict) {
        let counts = verdict.counts();
        if verdict.harness_broken() {
            state.ledger.record(
                false,
                &StepDetail::Note {
                    text: "verification harness failed (no checks executed)".to_string(),
                },
            );
        } else {
            state.ledger.record(
                verdict.passed(),
                &StepDetail::Verified {
                    passing: counts.passing,
                    total: counts.total,
                },
            );
        }
        state.observe_verdict(verdict);
    }

    /// Execute a workspace-mutating action. Failures are reported in the
    /// step record, never as errors.
    fn execute_workspace_action(
        &self,
        action: &Action,
        workspace: &Path,
        cancel: &CancelToken,
    ) -> Result<(StepDetail, bool)> {
        match action {
            Action::ReadFile { path } => {
                let resolved = match resolve_workspace_path(workspace, path) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        return Ok((
                            StepDetail::Note {
                                text: format!("read {path} rejected: {err}"),
                            },
                            false,
                        ));
                    }
                };
                match std::fs::read(&resolved) {
                    Ok(bytes) => Ok((
                        StepDetail::ReadFile {
                            path: path.clone(),
                            bytes: bytes.len(),
                        },
                        true,
                    )),
                    Err(err) => Ok((
                        StepDetail::Note {
                            text: format!("read {path} failed: {err}"),
                        },
                        false,
                    )),
                }
            }
            Action::WriteFile { path, content } => {
                let resolved = match resolve_workspace_path(workspace, path) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        return Ok((
                            StepDetail::Note {
                                text: format!("write {path} rejected: {err}"),
                            },
                            false,
                        ));
                    }
                };
                if let Some(parent) = resolved.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                match std::fs::write(&resolved, content) {
                    Ok(()) => Ok((
                        StepDetail::WroteFile {
                            path: path.clone(),
                            bytes: content.len(),
                        },
                        true,
                    )),
                    Err(err) => Ok((
                        StepDetail::Note {
                            text: format!("write {path} failed: {err}"),
                        },
                        false,
                    )),
                }
            }
            Action::RunCommand { command } => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command).current_dir(workspace);
                let output = run_command_with_timeout(
                    cmd,
                    None,
                    self.options.action_timeout,
                    self.options.action_output_limit_bytes,
                    Some(cancel),
                )
                .context("run actor command")?;
                let exit = output.exit_code();
                Ok((
                    StepDetail::RanCommand {
                        command: command.clone(),
                        exit,
                    },
                    exit == Some(0),
                ))
            }
            Action::Verify | Action::Complete { .. } => {
                unreachable!("verify/complete are handled by the turn loop")
            }
        }
    }

    fn finish(
        &self,
        state: LoopState,
        start: Instant,
        fail_reason: Option<FailReason>,
    ) -> RunReport {
        let passed = fail_reason.is_none();
        if let Some(reason) = fail_reason {
            info!(reason = reason.code(), turns = state.turns, "run failed");
        } else {
            info!(turns = state.turns, "run passed");
        }
        RunReport {
            passed,
            progress: if passed { 1.0 } else { state.best_progress },
            turns: state.turns,
            duration_ms: start.elapsed().as_millis() as u64,
            resource_units: state.resource_units,
            fail_reason,
            history: state.ledger.into_records(),
            final_verdict: state.last_verdict,
        }
    }
}

/// Resolve an actor-supplied path inside the workspace, rejecting escapes.
fn resolve_workspace_path(workspace: &Path, path: &str) -> Result<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let relative = Path::new(trimmed);
    if relative
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        return Err(anyhow!("path escapes workspace"));
    }
    Ok(workspace.join(relative))
}

/// A sampled candidate: an action executed against an isolated workspace
/// copy, awaiting verification. The copy is removed when the candidate is
/// dropped, so failed and discarded candidates leave nothing behind.
struct TurnCandidate {
    workspace: PathBuf,
    action: Action,
    detail: StepDetail,
    success: bool,
}

impl Drop for TurnCandidate {
    fn drop(&mut self) {
        remove_dir_best_effort(&self.workspace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::ActionRequest;
    use crate::test_support::{
        ScriptedProvider, ScriptedReply, ScriptedVerifier, complete_action, protected_verdict,
        sample_task, write_action,
    };
    use serde_json::json;

    fn options(max_turns: u32, verify_retry_limit: u32) -> RunOptions {
        let mut options = RunOptions::default();
        options.params.max_turns = max_turns;
        options.params.verify_retry_limit = verify_retry_limit;
        options.provider_retry = RetryGate::immediate(2);
        options
    }

    fn run_with(
        provider: &ScriptedProvider,
        verifier: &ScriptedVerifier,
        options: RunOptions,
    ) -> RunReport {
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        std::fs::create_dir_all(&workspace).expect("workspace");
        let task = sample_task(Some("refine"));
        Orchestrator::new(provider, verifier, options)
            .run(&task, &workspace, &CancelToken::new())
            .expect("run")
    }

    #[test]
    fn quick_success_passes_via_gate() {
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Action(write_action("solution.py", "print('x')")),
            ScriptedReply::Action(complete_action()),
        ]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);

        let report = run_with(&provider, &verifier, options(10, 2));
        assert!(report.passed);
        assert_eq!(report.turns, 2);
        assert!((report.progress - 1.0).abs() < 1e-9);
        assert_eq!(verifier.calls(), 1);
        assert!(report.fail_reason.is_none());
    }

    #[test]
    fn done_signal_never_bypasses_verification() {
        // The actor insists it is done; the verifier disagrees every time.
        // The run must keep looping until the retry limit, then fail with
        // verify-exhausted — never terminate as successful.
        let provider = ScriptedProvider::new(vec![ScriptedReply::Action(complete_action())]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(2, 4)]);

        let report = run_with(&provider, &verifier, options(20, 2));
        assert!(!report.passed);
        assert_eq!(report.fail_reason, Some(FailReason::VerifyExhausted));
        // Limit 2 means the third failed gate verification exhausts it.
        assert_eq!(verifier.calls(), 3);
        assert!((report.progress - 0.5).abs() < 1e-9);
    }

    #[test]
    fn repeated_identical_action_triggers_the_gate() {
        let provider =
            ScriptedProvider::new(vec![ScriptedReply::Action(write_action("a.txt", "same"))]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);

        let report = run_with(&provider, &verifier, options(10, 2));
        assert!(report.passed);
        // Two identical writes pass quietly; the third trips the repeat
        // threshold and gates.
        assert_eq!(report.turns, 3);
        assert_eq!(verifier.calls(), 1);
    }

    #[test]
    fn improving_progress_scenario_ends_in_pass() {
        // Turn-by-turn: write, verify (0.4), write (different), verify
        // (0.4 again — no improvement, but not an identical-action repeat,
        // so no heuristic fires), verify (1.0) => pass on turn 5.
        let verify = ActionRequest {
            name: "verify".to_string(),
            arguments: json!({}),
        };
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Action(write_action("m.py", "v1")),
            ScriptedReply::Action(verify.clone()),
            ScriptedReply::Action(write_action("m.py", "longer v2")),
            ScriptedReply::Action(verify.clone()),
            ScriptedReply::Action(verify),
        ]);
        let verifier = ScriptedVerifier::new(vec![
            protected_verdict(2, 5),
            protected_verdict(2, 5),
            protected_verdict(5, 5),
        ]);

        let report = run_with(&provider, &verifier, options(12, 2));
        assert!(report.passed);
        assert_eq!(report.turns, 5);
        assert_eq!(verifier.calls(), 3);
    }

    #[test]
    fn turn_budget_exhaustion_is_reported() {
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Action(write_action("a.txt", "1")),
            ScriptedReply::Action(write_action("b.txt", "2")),
            ScriptedReply::Action(write_action("a.txt", "1")),
            ScriptedReply::Action(write_action("b.txt", "2")),
        ]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(0, 4)]);

        let mut options = options(4, 2);
        // Keep the script alternating so the repeat heuristic stays quiet.
        options.params.max_turns = 4;
        let report = run_with(&provider, &verifier, options);
        assert!(!report.passed);
        assert_eq!(report.fail_reason, Some(FailReason::TurnBudgetExhausted));
        assert_eq!(verifier.calls(), 0);
        assert_eq!(report.turns, 4);
    }

    #[test]
    fn unknown_action_is_rejected_and_loop_continues() {
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Action(ActionRequest {
                name: "summon_demon".to_string(),
                arguments: json!({}),
            }),
            ScriptedReply::Action(complete_action()),
        ]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);

        let report = run_with(&provider, &verifier, options(10, 2));
        assert!(report.passed);
        assert!(
            report
                .history
                .iter()
                .any(|record| record.action == "rejected" && record.summary.contains("summon_demon"))
        );
    }

    #[test]
    fn provider_outage_fails_the_step_not_the_run() {
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Unavailable,
            ScriptedReply::Unavailable,
            ScriptedReply::Action(complete_action()),
        ]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);

        let report = run_with(&provider, &verifier, options(10, 2));
        assert!(report.passed);
        assert!(
            report
                .history
                .iter()
                .any(|record| record.summary.contains("provider unavailable"))
        );
    }

    #[test]
    fn broken_harness_does_not_consume_verify_retries() {
        let provider = ScriptedProvider::new(vec![ScriptedReply::Action(complete_action())]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(0, 0)]);

        let report = run_with(&provider, &verifier, options(6, 1));
        assert!(!report.passed);
        // Every gate hit a broken harness; the run must end on the turn
        // budget, not verify-exhausted.
        assert_eq!(report.fail_reason, Some(FailReason::TurnBudgetExhausted));
    }

    #[test]
    fn malformed_reply_is_salvaged_before_failing() {
        let provider = ScriptedProvider::new(vec![
            ScriptedReply::Raw(
                "Sure, I'll finish up:\n```json\n{\"name\": \"complete\", \"arguments\": {}}\n```"
                    .to_string(),
            ),
        ]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(3, 3)]);

        let report = run_with(&provider, &verifier, options(10, 2));
        assert!(report.passed);
        assert_eq!(report.turns, 1);
    }

    #[test]
    fn cancellation_stops_the_run() {
        let provider = ScriptedProvider::new(vec![ScriptedReply::Action(complete_action())]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        std::fs::create_dir_all(&workspace).expect("workspace");
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Orchestrator::new(&provider, &verifier, options(10, 2))
            .run(&sample_task(None), &workspace, &cancel)
            .expect("run");
        assert!(!report.passed);
        assert_eq!(report.fail_reason, Some(FailReason::Cancelled));
        assert_eq!(report.turns, 0);
    }

    #[test]
    fn sampled_turn_merges_only_the_verified_winner() {
        let provider =
            ScriptedProvider::new(vec![ScriptedReply::Action(write_action("out.txt", "best"))]);
        let verifier = ScriptedVerifier::new(vec![protected_verdict(4, 4)]);
        let temp = tempfile::tempdir().expect("tempdir");
        let workspace = temp.path().join("ws");
        std::fs::create_dir_all(&workspace).expect("workspace");

        let mut options = options(10, 2);
        options.params.sample_width = 3;
        let report = Orchestrator::new(&provider, &verifier, options)
            .run(&sample_task(Some("refine")), &workspace, &CancelToken::new())
            .expect("run");

        assert!(report.passed);
        assert_eq!(
            std::fs::read_to_string(workspace.join("out.txt")).expect("read"),
            "best"
        );
        // No candidate copies may outlive the round.
        let leftovers: Vec<_> = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".cand"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn workspace_paths_cannot_escape() {
        let workspace = Path::new("/tmp/ws");
        assert!(resolve_workspace_path(workspace, "../secrets").is_err());
        assert!(resolve_workspace_path(workspace, "sub/../../etc").is_err());
        let resolved = resolve_workspace_path(workspace, "/app/file.txt").expect("resolve");
        assert_eq!(resolved, workspace.join("app/file.txt"));
    }
}
