//! Bounded, tool-aware summarization of execution history.
//!
//! The ledger is what keeps actor prompts from growing with run length:
//! `render` returns at most `window` one-line summaries, each capped at
//! [`SUMMARY_CAP`] characters, regardless of how many steps the run has
//! taken. The full record list stays available for run persistence.

use serde::{Deserialize, Serialize};

/// Character cap for one rendered step summary.
pub const SUMMARY_CAP: usize = 100;

/// Sentinel rendered when no steps have been recorded yet.
pub const EMPTY_LEDGER: &str = "(none)";

/// Structured description of one executed step, used to build summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDetail {
    ReadFile { path: String, bytes: usize },
    WroteFile { path: String, bytes: usize },
    RanCommand { command: String, exit: Option<i32> },
    Verified { passing: u32, total: u32 },
    Rejected { name: String },
    Note { text: String },
}

impl StepDetail {
    pub fn action_name(&self) -> &'static str {
        match self {
            StepDetail::ReadFile { .. } => "read_file",
            StepDetail::WroteFile { .. } => "write_file",
            StepDetail::RanCommand { .. } => "run_command",
            StepDetail::Verified { .. } => "verify",
            StepDetail::Rejected { .. } => "rejected",
            StepDetail::Note { .. } => "note",
        }
    }
}

/// One executed action in a run's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-indexed sequence number.
    pub seq: u32,
    pub action: String,
    pub success: bool,
    pub summary: String,
}

/// Append-only step history with a bounded render window.
#[derive(Debug, Clone)]
pub struct StepLedger {
    records: Vec<StepRecord>,
    window: usize,
}

impl StepLedger {
    pub fn new(window: usize) -> Self {
        Self {
            records: Vec::new(),
            window: window.max(1),
        }
    }

    /// Record a step, deriving a capped tool-aware summary.
    pub fn record(&mut self, success: bool, detail: &StepDetail) {
        let seq = self.records.len() as u32 + 1;
        self.records.push(StepRecord {
            seq,
            action: detail.action_name().to_string(),
            success,
            summary: summarize(detail),
        });
    }

    /// Render the last `window` summaries for prompt injection.
    pub fn render(&self) -> String {
        if self.records.is_empty() {
            return EMPTY_LEDGER.to_string();
        }
        let start = self.records.len().saturating_sub(self.window);
        self.records[start..]
            .iter()
            .map(|record| {
                let mark = if record.success { "ok" } else { "failed" };
                format!("{}. [{}] {}", record.seq, mark, record.summary)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Full history, independent of the render window.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }
}

fn summarize(detail: &StepDetail) -> String {
    let summary = match detail {
        StepDetail::ReadFile { path, bytes } => format!("Read {path} ({bytes} bytes)"),
        StepDetail::WroteFile { path, bytes } => format!("Wrote {bytes} bytes to {path}"),
        StepDetail::RanCommand { command, exit } => {
            let prefix = truncate_chars(command.trim(), 40);
            match exit {
                Some(code) => format!("Ran: {prefix} (exit {code})"),
                None => format!("Ran: {prefix} (killed)"),
            }
        }
        StepDetail::Verified { passing, total } => {
            format!("Verify: {passing}/{total} checks passing")
        }
        StepDetail::Rejected { name } => format!("Rejected unknown action '{name}'"),
        StepDetail::Note { text } => text.clone(),
    };
    truncate_chars(&summary, SUMMARY_CAP)
}

/// Truncate to at most `max` characters, appending an ellipsis marker.
pub fn truncate_chars(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    let kept: String = input.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}\u{2026}")
}
