//! Read-only summaries over recent runs.

use anyhow::Result;

use crate::store::{RunRecord, Store, StoreStats};

/// Aggregated view for `evolve stats`.
#[derive(Debug)]
pub struct StatsSummary {
    pub stats: StoreStats,
    pub recent: Vec<RunRecord>,
    pub avg_turns: Option<f64>,
    pub avg_score: Option<f64>,
}

pub fn summarize(store: &Store, limit: u32) -> Result<StatsSummary> {
    let stats = store.stats()?;
    let recent = store.recent_runs(limit)?;
    let avg_turns = average(recent.iter().map(|run| f64::from(run.turns)));
    let avg_score = average(recent.iter().map(|run| run.score as f64));
    Ok(StatsSummary {
        stats,
        recent,
        avg_turns,
        avg_score,
    })
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return None;
    }
    Some(collected.iter().sum::<f64>() / collected.len() as f64)
}

pub fn print_summary(summary: &StatsSummary) {
    let stats = &summary.stats;
    let pass_rate = if stats.total_runs > 0 {
        stats.total_passes as f64 / stats.total_runs as f64
    } else {
        0.0
    };
    println!(
        "stats: runs={} passes={} pass_rate={:.2} tasks={} configs={}",
        stats.total_runs, stats.total_passes, pass_rate, stats.unique_tasks, stats.unique_configs
    );
    if let (Some(avg_turns), Some(avg_score)) = (summary.avg_turns, summary.avg_score) {
        println!(
            "stats: recent avg_turns={:.1} avg_score={:.0} (last {} runs)",
            avg_turns,
            avg_score,
            summary.recent.len()
        );
    }

    let mut scopes: Vec<_> = stats.by_scope.values().collect();
    scopes.sort_by(|a, b| a.scope.cmp(&b.scope));
    for best in scopes {
        println!(
            "stats: scope={} best_score={} best_config={} passes={}/{}",
            best.scope, best.score, best.config_id, best.pass_count, best.total_runs
        );
    }

    for run in &summary.recent {
        println!(
            "run: {} task={} scope={} passed={} score={} turns={}{}",
            run.run_id,
            run.task_id,
            run.scope,
            run.passed,
            run.score,
            run.turns,
            run.fail_reason
                .as_deref()
                .map(|reason| format!(" reason={reason}"))
                .unwrap_or_default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RunInput;

    #[test]
    fn summarizes_runs_and_averages() {
        let mut store = Store::open_in_memory().expect("store");
        let config = store.current_config("global").expect("config");
        for (i, (passed, score, turns)) in
            [(true, 1100i64, 10u32), (false, 60, 24)].iter().enumerate()
        {
            let run = store
                .save_run(&RunInput {
                    run_id: format!("run-{i}"),
                    scope: "global".to_string(),
                    task_id: "t".to_string(),
                    config_id: config.id,
                    passed: *passed,
                    progress: if *passed { 1.0 } else { 0.3 },
                    turns: *turns,
                    duration_ms: 100,
                    resource_units: 10,
                    fail_reason: (!passed).then(|| "timeout".to_string()),
                    score: *score,
                })
                .expect("save run");
            store
                .update_best_if_better("global", config.id, run.id, *score, *passed)
                .expect("best");
        }

        let summary = summarize(&store, 10).expect("summarize");
        assert_eq!(summary.stats.total_runs, 2);
        assert_eq!(summary.stats.total_passes, 1);
        assert_eq!(summary.recent.len(), 2);
        assert!((summary.avg_turns.expect("turns") - 17.0).abs() < 1e-9);
        assert!((summary.avg_score.expect("score") - 580.0).abs() < 1e-9);
        assert_eq!(summary.stats.by_scope["global"].score, 1100);
    }

    #[test]
    fn empty_store_has_no_averages() {
        let store = Store::open_in_memory().expect("store");
        let summary = summarize(&store, 10).expect("summarize");
        assert_eq!(summary.stats.total_runs, 0);
        assert!(summary.avg_turns.is_none());
    }
}
