//! Scripted fakes for orchestrator and sampler tests.
//!
//! Providers and verifiers are scripted with predetermined outputs so
//! tests exercise the loop without spawning processes or containers.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use serde_json::json;

use crate::cancel::CancelToken;
use crate::core::action::ActionRequest;
use crate::core::task::{SandboxSpec, TaskDefinition, VerifySource};
use crate::core::verify::{CheckCounts, ProtectedReport, SelfReport, Verdict};
use crate::io::provider::{Proposal, Provider, ProposeRequest};
use crate::io::sandbox::Verifier;

/// A provider that replays a scripted sequence of raw replies. When the
/// script runs out, the last entry repeats.
pub struct ScriptedProvider {
    replies: Mutex<Vec<ScriptedReply>>,
    cursor: Mutex<usize>,
}

pub enum ScriptedReply {
    Action(ActionRequest),
    Raw(String),
    Unavailable,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies),
            cursor: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.cursor.lock().expect("cursor lock")
    }
}

impl Provider for ScriptedProvider {
    fn propose(&self, _request: &ProposeRequest) -> Result<Proposal> {
        let replies = self.replies.lock().expect("replies lock");
        let mut cursor = self.cursor.lock().expect("cursor lock");
        let index = (*cursor).min(replies.len().saturating_sub(1));
        *cursor += 1;
        match &replies[index] {
            ScriptedReply::Action(action) => Ok(Proposal {
                action: action.clone(),
                raw: serde_json::to_string(action).expect("serialize action"),
            }),
            ScriptedReply::Raw(raw) => {
                let action = crate::io::provider::parse_proposal(raw)?;
                Ok(Proposal {
                    action,
                    raw: raw.clone(),
                })
            }
            ScriptedReply::Unavailable => Err(anyhow!("provider unavailable")),
        }
    }
}

/// A verifier that replays a scripted sequence of verdicts. When the
/// script runs out, the last verdict repeats.
pub struct ScriptedVerifier {
    verdicts: Mutex<Vec<Verdict>>,
    cursor: Mutex<usize>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        assert!(!verdicts.is_empty(), "scripted verifier needs verdicts");
        Self {
            verdicts: Mutex::new(verdicts),
            cursor: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.cursor.lock().expect("cursor lock")
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(
        &self,
        _workspace: &Path,
        _task: &TaskDefinition,
        _cancel: &CancelToken,
    ) -> Result<Verdict> {
        let verdicts = self.verdicts.lock().expect("verdicts lock");
        let mut cursor = self.cursor.lock().expect("cursor lock");
        let index = (*cursor).min(verdicts.len() - 1);
        *cursor += 1;
        Ok(verdicts[index].clone())
    }
}

/// Protected verdict with the given counts.
pub fn protected_verdict(passing: u32, total: u32) -> Verdict {
    let passed = total > 0 && passing == total;
    Verdict::Protected(ProtectedReport::new(
        passed,
        CheckCounts::new(passing, total),
        Vec::new(),
        if passed {
            String::new()
        } else {
            format!("{} of {total} checks are failing.", total - passing)
        },
        Some(i32::from(!passed)),
        5,
    ))
}

/// Self-generated verdict with the given counts and no failure detail.
pub fn self_verdict(passing: u32, total: u32) -> Verdict {
    let passed = total > 0 && passing == total;
    Verdict::SelfChecked(SelfReport {
        passed,
        counts: CheckCounts::new(passing, total),
        failures: Vec::new(),
        exit_code: Some(i32::from(!passed)),
        duration_ms: 5,
    })
}

/// Action request for a `write_file` step.
pub fn write_action(path: &str, content: &str) -> ActionRequest {
    ActionRequest {
        name: "write_file".to_string(),
        arguments: json!({"path": path, "content": content}),
    }
}

/// Action request for a `complete` declaration.
pub fn complete_action() -> ActionRequest {
    ActionRequest {
        name: "complete".to_string(),
        arguments: json!({"summary": "done"}),
    }
}

/// Minimal valid task definition for tests.
pub fn sample_task(task_type: Option<&str>) -> TaskDefinition {
    TaskDefinition {
        id: "sample".to_string(),
        description: "Write a 4-digit-year date matcher".to_string(),
        task_type: task_type.map(ToString::to_string),
        difficulty: None,
        verify_command: "pytest -q".to_string(),
        verify_source: VerifySource::Protected,
        setup_command: None,
        sandbox: SandboxSpec::default(),
        seed_dir: None,
    }
}
