//! The configuration-evolution loop.
//!
//! Each iteration runs one task attempt under the scope's current
//! configuration, scores it, asks the reasoner for one bounded delta, and
//! commits or rejects the proposal against the guardrails. Every attempt
//! outcome — pass or failure — is valid scoring data, and no single
//! iteration failure crashes the loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use engine::cancel::CancelToken;
use engine::core::params::{EngineParams, Guardrails, apply_delta, validate_delta};
use engine::core::score::score_run;
use engine::core::task::TaskDefinition;
use engine::io::provider::Provider;
use engine::io::sandbox::Verifier;
use engine::io::workspace::copy_dir;
use engine::orchestrator::{Orchestrator, RunOptions, RunReport};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{info, instrument, warn};

use crate::reasoner::{Reasoner, ReasonerContext, ReasonerGate};
use crate::store::{ChangeInput, RunInput, Store};

/// Runs one task attempt under a given parameter set.
///
/// The production implementation drives the engine orchestrator; tests
/// script outcomes. A failed run is an `Ok` report with a failure reason —
/// `Err` is reserved for infrastructure problems (workspace creation, task
/// validation).
pub trait AttemptRunner {
    fn run_attempt(&self, task: &TaskDefinition, params: &EngineParams) -> Result<RunReport>;
}

/// Production attempt runner: fresh workspace per run, engine orchestrator
/// with the configuration's parameters.
pub struct EngineAttemptRunner<'a, P: Provider, V: Verifier> {
    pub provider: &'a P,
    pub verifier: &'a V,
    pub workspaces_dir: PathBuf,
    pub wall_clock: Duration,
    pub prompt_budget_bytes: usize,
    pub max_tokens: u32,
}

impl<P: Provider, V: Verifier> AttemptRunner for EngineAttemptRunner<'_, P, V> {
    #[instrument(skip_all, fields(task_id = %task.id))]
    fn run_attempt(&self, task: &TaskDefinition, params: &EngineParams) -> Result<RunReport> {
        let workspace = self
            .workspaces_dir
            .join(workspace_name(&task.id, &generate_timestamp(), &generate_short_id()));
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("create workspace {}", workspace.display()))?;
        if let Some(seed) = &task.seed_dir {
            copy_dir(seed, &workspace).context("seed workspace")?;
        }

        let options = RunOptions {
            params: params.clone(),
            wall_clock: self.wall_clock,
            prompt_budget_bytes: self.prompt_budget_bytes,
            max_tokens: self.max_tokens,
            ..RunOptions::default()
        };
        Orchestrator::new(self.provider, self.verifier, options).run(
            task,
            &workspace,
            &CancelToken::new(),
        )
    }
}

pub fn workspace_name(task_id: &str, timestamp: &str, short_id: &str) -> String {
    format!("{task_id}_{timestamp}_{short_id}")
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn new_run_id() -> String {
    format!("run-{}-{}", generate_timestamp(), generate_short_id())
}

/// What happened to the iteration's configuration proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    Accepted {
        config_id: i64,
        version: String,
        reasoning: String,
    },
    Rejected {
        reason: String,
        reasoning: String,
    },
    KeptCurrent {
        reason: String,
    },
}

/// Summary of one evolution iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub run_id: String,
    pub config_id: i64,
    pub passed: bool,
    pub score: i64,
    pub fail_reason: Option<String>,
    pub decision: ChangeDecision,
}

/// An accepted change waiting for its observed score delta: filled in
/// when the next run under the new configuration completes.
struct PendingChange {
    change_id: i64,
    baseline_score: i64,
    config_id: i64,
}

/// Aggregate counters for a bounded evolution loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u32,
    pub passes: u32,
    pub failures: u32,
    pub errors: u32,
}

pub struct Controller<'a, R: AttemptRunner, Z: Reasoner> {
    store: &'a mut Store,
    runner: &'a R,
    reasoner: &'a Z,
    gate: &'a ReasonerGate,
    guardrails: Guardrails,
    pending: Option<PendingChange>,
}

impl<'a, R: AttemptRunner, Z: Reasoner> Controller<'a, R, Z> {
    pub fn new(
        store: &'a mut Store,
        runner: &'a R,
        reasoner: &'a Z,
        gate: &'a ReasonerGate,
    ) -> Self {
        Self {
            store,
            runner,
            reasoner,
            gate,
            guardrails: Guardrails::default(),
            pending: None,
        }
    }

    /// One full evolution iteration for `task`.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn run_iteration(&mut self, task: &TaskDefinition) -> Result<IterationReport> {
        let scope = task.scope().to_string();
        let config = self.store.current_config(&scope)?;

        let report = self.runner.run_attempt(task, &config.params)?;
        let score = score_run(report.passed, report.turns, report.resource_units);
        let fail_reason = report.fail_reason.map(|reason| reason.code().to_string());

        let run_id = new_run_id();
        let run_row = self.store.save_run(&RunInput {
            run_id: run_id.clone(),
            scope: scope.clone(),
            task_id: task.id.clone(),
            config_id: config.id,
            passed: report.passed,
            progress: report.progress,
            turns: report.turns,
            duration_ms: report.duration_ms,
            resource_units: report.resource_units,
            fail_reason: fail_reason.clone(),
            score,
        })?;
        self.store
            .update_best_if_better(&scope, config.id, run_row.id, score, report.passed)?;
        info!(score, passed = report.passed, "attempt scored");

        // The previous accepted change gets its observed delta once a run
        // under the new configuration lands.
        if let Some(pending) = self.pending.take() {
            if pending.config_id == config.id {
                self.store
                    .set_observed_delta(pending.change_id, score - pending.baseline_score)?;
            } else {
                self.pending = Some(pending);
            }
        }

        let recent = self.store.recent_runs_for_scope(&scope, 5)?;
        let context = ReasonerContext {
            scope: &scope,
            params: &config.params,
            recent: &recent,
        };
        let decision = match self.gate.propose(self.reasoner, &context) {
            None => ChangeDecision::KeptCurrent {
                reason: "reasoner unavailable".to_string(),
            },
            Some(delta) if delta.is_empty() => ChangeDecision::KeptCurrent {
                reason: "reasoner proposed no change".to_string(),
            },
            Some(delta) => {
                let delta_json =
                    serde_json::to_string(&delta).context("serialize proposed delta")?;
                let errors = validate_delta(&config.params, &delta, &self.guardrails);
                if errors.is_empty() {
                    let next = apply_delta(&config.params, &delta);
                    let saved = self.store.save_config(&scope, &next)?;
                    self.store.set_current(&scope, saved.id)?;
                    let change_id = self.store.record_change(&ChangeInput {
                        scope: scope.clone(),
                        from_config_id: config.id,
                        to_config_id: Some(saved.id),
                        delta_json,
                        reasoning: delta.reasoning.clone(),
                        accepted: true,
                        reject_reason: None,
                    })?;
                    self.pending = Some(PendingChange {
                        change_id,
                        baseline_score: score,
                        config_id: saved.id,
                    });
                    info!(config_id = saved.id, version = %saved.params.version, "change accepted");
                    ChangeDecision::Accepted {
                        config_id: saved.id,
                        version: saved.params.version.clone(),
                        reasoning: delta.reasoning,
                    }
                } else {
                    let reason = errors.join("; ");
                    self.store.record_change(&ChangeInput {
                        scope: scope.clone(),
                        from_config_id: config.id,
                        to_config_id: None,
                        delta_json,
                        reasoning: delta.reasoning.clone(),
                        accepted: false,
                        reject_reason: Some(reason.clone()),
                    })?;
                    info!(reason = %reason, "change rejected");
                    ChangeDecision::Rejected {
                        reason,
                        reasoning: delta.reasoning,
                    }
                }
            }
        };

        Ok(IterationReport {
            run_id,
            config_id: config.id,
            passed: report.passed,
            score,
            fail_reason,
            decision,
        })
    }

    /// Run up to `max_iterations` iterations, sleeping between them. A
    /// single iteration's error is logged and counted, never fatal.
    pub fn run_loop<F: FnMut(&IterationReport)>(
        &mut self,
        task: &TaskDefinition,
        max_iterations: u32,
        sleep: Duration,
        cancel: &CancelToken,
        mut on_iteration: F,
    ) -> Result<LoopSummary> {
        let mut summary = LoopSummary::default();
        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                break;
            }
            summary.iterations += 1;
            match self.run_iteration(task) {
                Ok(report) => {
                    if report.passed {
                        summary.passes += 1;
                    } else {
                        summary.failures += 1;
                    }
                    on_iteration(&report);
                }
                Err(err) => {
                    warn!(iteration, err = %err, "evolution iteration failed, continuing");
                    summary.errors += 1;
                }
            }
            if iteration < max_iterations && !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }
        Ok(summary)
    }
}
