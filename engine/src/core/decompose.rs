//! Declarative task decomposition.
//!
//! A small table maps task types to subtask templates; unrecognized types
//! fall back to a generic three-stage template rather than erroring. The
//! decomposer must never encode solution-specific content: guidance is
//! limited to domain-general process advice, and all task knowledge comes
//! from the task description passed through unchanged.

use crate::core::task::TaskDefinition;

/// One ordered step of a task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtask {
    pub id: String,
    pub goal: String,
    /// Turns allotted to this subtask before the loop advances.
    pub turn_budget: u32,
    pub guidance: Option<String>,
    /// Things the actor is told not to do during this subtask.
    pub avoid: Vec<String>,
}

struct StageTemplate {
    id: &'static str,
    goal: &'static str,
    weight: u32,
    guidance: Option<&'static str>,
    avoid: &'static [&'static str],
}

const SINGLE_STAGE: &[StageTemplate] = &[StageTemplate {
    id: "solve",
    goal: "Produce a complete solution and confirm it verifies",
    weight: 1,
    guidance: Some("Make the smallest change that satisfies the task, then verify."),
    avoid: &[],
}];

const ITERATIVE_STAGES: &[StageTemplate] = &[
    StageTemplate {
        id: "produce-initial-solution",
        goal: "Write a first complete attempt at the task",
        weight: 2,
        guidance: Some("Prefer a working end-to-end draft over a perfect fragment."),
        avoid: &["Do not spend turns exploring before writing anything."],
    },
    StageTemplate {
        id: "iterate-against-feedback",
        goal: "Run verification and fix what it reports, one issue at a time",
        weight: 2,
        guidance: Some("Verify after each substantive change; let the counts guide you."),
        avoid: &[],
    },
    StageTemplate {
        id: "final-check",
        goal: "Confirm the full check suite passes and declare completion",
        weight: 1,
        guidance: None,
        avoid: &["Do not declare completion without a passing verification."],
    },
];

const GENERIC_STAGES: &[StageTemplate] = &[
    StageTemplate {
        id: "understand",
        goal: "Inspect the workspace and restate what the task requires",
        weight: 1,
        guidance: Some("Read existing files before writing new ones."),
        avoid: &[],
    },
    StageTemplate {
        id: "implement",
        goal: "Implement the solution described by the task",
        weight: 3,
        guidance: None,
        avoid: &[],
    },
    StageTemplate {
        id: "verify",
        goal: "Run verification and fix remaining failures",
        weight: 1,
        guidance: Some("Verify before declaring completion."),
        avoid: &[],
    },
];

/// Split a task into an ordered subtask plan. Always returns at least one
/// subtask; unknown task types get the generic template.
pub fn decompose(task: &TaskDefinition, max_turns: u32) -> Vec<Subtask> {
    let stages = match task.task_type.as_deref() {
        Some("single-step") => SINGLE_STAGE,
        Some("refine") | Some("iterative") => ITERATIVE_STAGES,
        _ => GENERIC_STAGES,
    };
    instantiate(stages, max_turns)
}

fn instantiate(stages: &[StageTemplate], max_turns: u32) -> Vec<Subtask> {
    let budgets = split_budget(max_turns, stages);
    stages
        .iter()
        .zip(budgets)
        .map(|(stage, turn_budget)| Subtask {
            id: stage.id.to_string(),
            goal: stage.goal.to_string(),
            turn_budget,
            guidance: stage.guidance.map(ToString::to_string),
            avoid: stage.avoid.iter().map(ToString::to_string).collect(),
        })
        .collect()
}

/// Distribute `max_turns` across stages proportionally to weight, giving
/// every stage at least one turn and the remainder to the heaviest stage.
fn split_budget(max_turns: u32, stages: &[StageTemplate]) -> Vec<u32> {
    let total_weight: u32 = stages.iter().map(|s| s.weight).sum();
    let max_turns = max_turns.max(stages.len() as u32);
    let mut budgets: Vec<u32> = stages
        .iter()
        .map(|s| (max_turns * s.weight / total_weight).max(1))
        .collect();
    let assigned: u32 = budgets.iter().sum();
    if assigned < max_turns
        && let Some(heaviest) = stages
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.weight)
            .map(|(i, _)| i)
    {
        budgets[heaviest] += max_turns - assigned;
    }
    budgets
}
