//! CLI command implementations.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use engine::cancel::CancelToken;
use engine::core::score::score_run;
use engine::io::provider::CommandProvider;
use engine::io::retry::RetryGate;
use engine::io::sandbox::DockerVerifier;
use tracing::{debug, info};

use crate::config::EvolveConfig;
use crate::controller::{
    AttemptRunner, ChangeDecision, Controller, EngineAttemptRunner, IterationReport,
};
use crate::reasoner::{CommandReasoner, ReasonerGate};
use crate::report::{print_summary, summarize};
use crate::store::{RunInput, Store};
use crate::tasks::{discover_tasks, find_task};

fn provider_from(cfg: &EvolveConfig) -> CommandProvider {
    CommandProvider {
        command: cfg.provider.command.clone(),
        timeout: Duration::from_secs(cfg.provider.timeout_secs),
        output_limit_bytes: cfg.provider.output_limit_bytes,
    }
}

/// Run one task under the scope's current configuration. Returns whether
/// the run verified as passing.
pub fn cmd_run(cfg: &EvolveConfig, task_id: &str, scope_override: Option<&str>) -> Result<bool> {
    let task = find_task(&cfg.tasks_dir, task_id)?;
    let scope = scope_override.unwrap_or_else(|| task.scope()).to_string();
    let mut store = Store::open(&cfg.db_path)?;
    let config = store.current_config(&scope)?;
    debug!(config_id = config.id, version = %config.params.version, "using configuration");

    let provider = provider_from(cfg);
    let verifier = DockerVerifier::default();
    let runner = EngineAttemptRunner {
        provider: &provider,
        verifier: &verifier,
        workspaces_dir: cfg.workspaces_dir.clone(),
        wall_clock: cfg.wall_clock(),
        prompt_budget_bytes: cfg.prompt_budget_bytes,
        max_tokens: cfg.provider.max_tokens,
    };

    info!(task_id, scope = %scope, "run started");
    let report = runner.run_attempt(&task, &config.params)?;
    let score = score_run(report.passed, report.turns, report.resource_units);
    let fail_reason = report.fail_reason.map(|reason| reason.code().to_string());

    let run_row = store.save_run(&RunInput {
        run_id: format!("cli-{}", chrono::Utc::now().format("%Y%m%d_%H%M%S_%f")),
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
    store.update_best_if_better(&scope, config.id, run_row.id, score, report.passed)?;

    if report.passed {
        println!(
            "run: task={} passed score={} turns={}",
            task.id, score, report.turns
        );
    } else {
        println!(
            "run: task={} failed reason={} progress={:.2} score={} turns={}",
            task.id,
            fail_reason.as_deref().unwrap_or("unknown"),
            report.progress,
            score,
            report.turns
        );
    }
    Ok(report.passed)
}

/// Run the evolution loop for a task.
pub fn cmd_evolve(
    cfg: &EvolveConfig,
    task_id: &str,
    max_iterations: u32,
    sleep_secs: u64,
) -> Result<()> {
    let task = find_task(&cfg.tasks_dir, task_id)?;
    let mut store = Store::open(&cfg.db_path)?;

    let provider = provider_from(cfg);
    let verifier = DockerVerifier::default();
    let runner = EngineAttemptRunner {
        provider: &provider,
        verifier: &verifier,
        workspaces_dir: cfg.workspaces_dir.clone(),
        wall_clock: cfg.wall_clock(),
        prompt_budget_bytes: cfg.prompt_budget_bytes,
        max_tokens: cfg.provider.max_tokens,
    };
    let reasoner = CommandReasoner {
        command: cfg.reasoner.command.clone(),
        timeout: Duration::from_secs(cfg.reasoner.timeout_secs),
        output_limit_bytes: cfg.reasoner.output_limit_bytes,
    };
    let gate = ReasonerGate::new(RetryGate {
        max_attempts: cfg.reasoner.max_attempts,
        ..RetryGate::default()
    });

    let mut controller = Controller::new(&mut store, &runner, &reasoner, &gate);
    let summary = controller.run_loop(
        &task,
        max_iterations,
        Duration::from_secs(sleep_secs),
        &CancelToken::new(),
        print_iteration,
    )?;

    println!(
        "evolve: iterations={} passes={} failures={} errors={}",
        summary.iterations, summary.passes, summary.failures, summary.errors
    );
    Ok(())
}

fn print_iteration(report: &IterationReport) {
    println!(
        "iteration: run={} passed={} score={}{}",
        report.run_id,
        report.passed,
        report.score,
        report
            .fail_reason
            .as_deref()
            .map(|reason| format!(" reason={reason}"))
            .unwrap_or_default(),
    );
    match &report.decision {
        ChangeDecision::Accepted {
            config_id,
            version,
            reasoning,
        } => println!("change: accepted config={config_id} version={version} because {reasoning}"),
        ChangeDecision::Rejected { reason, reasoning } => {
            println!("change: rejected ({reason}) proposal was: {reasoning}");
        }
        ChangeDecision::KeptCurrent { reason } => println!("change: kept current ({reason})"),
    }
}

/// Print a read-only summary of recent runs and evolution changes.
pub fn cmd_stats(cfg: &EvolveConfig, limit: u32) -> Result<()> {
    let store = Store::open(&cfg.db_path)?;
    let summary = summarize(&store, limit).context("summarize runs")?;
    print_summary(&summary);
    for change in store.recent_changes(limit)? {
        println!(
            "change: {} {} -> {} accepted={}{}",
            change.scope,
            change.from_config_id,
            change
                .to_config_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            change.accepted,
            change
                .reject_reason
                .as_deref()
                .map(|reason| format!(" ({reason})"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

/// List all available tasks.
pub fn cmd_tasks(cfg: &EvolveConfig) -> Result<()> {
    for task in discover_tasks(&cfg.tasks_dir)? {
        println!(
            "{} [{}] {}",
            task.id,
            task.task_type.as_deref().unwrap_or("generic"),
            task.difficulty.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

/// Resolve the config file path, tolerating a missing default file.
pub fn load_cli_config(path: &Path) -> Result<EvolveConfig> {
    crate::config::load_config(path)
}
