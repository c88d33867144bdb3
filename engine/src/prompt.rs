//! Prompt pack builder for actor input.
//!
//! Prompts are assembled from a template with section markers and trimmed
//! to a byte budget by dropping droppable sections first, so prompt size
//! stays bounded regardless of run length or hint verbosity.

use minijinja::{Environment, context};
use tracing::debug;

use crate::core::decompose::Subtask;
use crate::core::ledger::truncate_chars;

const ACTOR_TEMPLATE: &str = include_str!("prompts/actor.md");

/// Cap applied to the task description before templating.
const TASK_DESCRIPTION_CAP: usize = 2_000;

/// All inputs needed to build one actor prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub subtask: &'a Subtask,
    pub task_description: &'a str,
    /// Rendered step ledger (bounded by the ledger itself).
    pub ledger: &'a str,
    /// Feedback line from the most recent verification, if any.
    pub feedback: Option<&'a str>,
    /// Reference-approach hints; rendered as explicit non-actions.
    pub hints: &'a [String],
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections from rendered template output using HTML comment markers.
///
/// Markers follow format: `<!-- section:KEY required|droppable -->`
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    use std::sync::LazyLock;
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let mut sections = Vec::new();
    let matches: Vec<_> = SECTION_RE.captures_iter(rendered).collect();

    for (i, caps) in matches.iter().enumerate() {
        let key = caps.get(1).unwrap().as_str().to_string();
        let required = caps.get(2).unwrap().as_str() == "required";
        let start = caps.get(0).unwrap().end();
        let end = matches
            .get(i + 1)
            .map(|m| m.get(0).unwrap().start())
            .unwrap_or(rendered.len());

        let content = rendered[start..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key,
                required,
                content,
            });
        }
    }

    sections
}

/// Apply budget to parsed sections, dropping droppable sections as needed.
///
/// Drop order: hints -> feedback -> ledger
fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total_len =
        |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    if total_len(sections) <= budget {
        return;
    }

    let drop_order = ["hints", "feedback", "ledger"];
    for key in drop_order {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped_len = sections[idx].content.len();
            debug!(
                section = key,
                bytes_dropped = dropped_len,
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    // If still over budget, truncate the last section.
    if total_len(sections) > budget && !sections.is_empty() {
        let other_len: usize = sections
            .iter()
            .take(sections.len() - 1)
            .map(|s| s.content.len())
            .sum();
        let allowed = budget.saturating_sub(other_len);
        let last = sections.last_mut().unwrap();
        if last.content.len() > allowed {
            if allowed > 12 {
                last.content.truncate(allowed - 12);
                last.content.push_str("\n[truncated]");
            } else {
                last.content.truncate(allowed);
            }
        }
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds a prompt pack within a byte budget, dropping less critical
/// sections first.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn build_actor(&self, input: &PromptInputs<'_>) -> PromptPack {
        let mut env = Environment::new();
        env.add_template("actor", ACTOR_TEMPLATE)
            .expect("actor template should be valid");
        let template = env.get_template("actor").expect("actor template");

        let task = truncate_chars(input.task_description.trim(), TASK_DESCRIPTION_CAP);
        let rendered = template
            .render(context! {
                goal => input.subtask.goal.trim(),
                guidance => input.subtask.guidance.as_deref().map(str::trim).filter(|s| !s.is_empty()),
                avoid => (!input.subtask.avoid.is_empty()).then_some(&input.subtask.avoid),
                task => task,
                ledger => (!input.ledger.trim().is_empty()).then(|| input.ledger.trim()),
                feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
                hints => (!input.hints.is_empty()).then_some(input.hints),
            })
            .expect("actor template rendering should not fail");

        let mut sections = parse_sections(&rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);

        PromptPack {
            content: render_sections(&sections),
        }
    }
}

/// A rendered prompt ready to send to the provider.
#[derive(Debug, Clone)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> String {
        self.content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask() -> Subtask {
        Subtask {
            id: "implement".to_string(),
            goal: "Implement the solution described by the task".to_string(),
            turn_budget: 8,
            guidance: Some("Read existing files before writing new ones.".to_string()),
            avoid: vec!["Do not declare completion without verification.".to_string()],
        }
    }

    #[test]
    fn sections_appear_in_stable_order() {
        let hints = vec!["Start from a failing check and work backwards.".to_string()];
        let subtask = subtask();
        let input = PromptInputs {
            subtask: &subtask,
            task_description: "Write a date matcher",
            ledger: "1. [ok] Wrote 10 bytes to solution.py",
            feedback: Some("3/10 checks passing."),
            hints: &hints,
        };
        let content = PromptBuilder::new(20_000).build_actor(&input).render();

        let contract = content.find("### Actor Contract").expect("contract");
        let goal = content.find("### Current Goal").expect("goal");
        let task = content.find("### Task").expect("task");
        let ledger = content.find("### Recent Steps").expect("ledger");
        let feedback = content.find("### Verification Feedback").expect("feedback");
        let hints_pos = content.find("### Reference Approaches").expect("hints");
        assert!(contract < goal && goal < task && task < ledger);
        assert!(ledger < feedback && feedback < hints_pos);
    }

    #[test]
    fn hints_are_marked_non_invocable() {
        let hints = vec!["Iterate against the check output.".to_string()];
        let subtask = subtask();
        let input = PromptInputs {
            subtask: &subtask,
            task_description: "task",
            ledger: "",
            feedback: None,
            hints: &hints,
        };
        let content = PromptBuilder::new(20_000).build_actor(&input).render();
        assert!(content.contains("not invocable actions"));
    }

    #[test]
    fn budget_drops_hints_before_required_sections() {
        let hints: Vec<String> = (0..50).map(|i| format!("hint {i} {}", "h".repeat(40))).collect();
        let subtask = subtask();
        let ledger = "1. [ok] step\n".repeat(10);
        let input = PromptInputs {
            subtask: &subtask,
            task_description: "task",
            ledger: &ledger,
            feedback: Some("2/4 checks passing."),
            hints: &hints,
        };
        let content = PromptBuilder::new(900).build_actor(&input).render();
        assert!(!content.contains("### Reference Approaches"));
        assert!(content.contains("### Actor Contract"));
        assert!(content.contains("### Current Goal"));
        assert!(content.contains("### Task"));
    }

    #[test]
    fn long_task_description_is_capped() {
        let subtask = subtask();
        let long = "d".repeat(50_000);
        let input = PromptInputs {
            subtask: &subtask,
            task_description: &long,
            ledger: "",
            feedback: None,
            hints: &[],
        };
        let content = PromptBuilder::new(100_000).build_actor(&input).render();
        assert!(content.len() < 10_000);
    }
}
