//! Task definitions consumed by the orchestrator and the sandboxed verifier.

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Provenance of a task's verification suite.
///
/// Determines how much detail the verifier is allowed to surface to the
/// actor. `Protected` suites expose pass/fail, counts, and failing check
/// names only; `SelfGenerated` suites may expose full failure details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySource {
    SelfGenerated,
    Protected,
}

/// Resource limits applied to a sandbox execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU allowance (`docker run --cpus`).
    pub cpus: f64,
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// Wall-clock limit for one verification execution.
    pub timeout_secs: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 1024,
            timeout_secs: 120,
        }
    }
}

/// Sandbox requirements for a task: how to obtain the execution image and
/// what limits to run it under.
///
/// Image resolution is three-tiered: a pinned reference image if declared,
/// a build recipe if the reference is unreachable, and a generic baseline
/// image when neither is available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSpec {
    /// Pinned reference image (e.g. `bench-python:3.11`).
    pub image: Option<String>,
    /// Path to a build recipe (Dockerfile) used when the image is unreachable.
    pub recipe: Option<PathBuf>,
    pub limits: ResourceLimits,
}

/// Immutable description of one task.
///
/// Loaded once per run from a task file and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Natural-language description handed to the actor.
    pub description: String,
    /// Optional task type used for decomposition and configuration scoping.
    pub task_type: Option<String>,
    /// Optional difficulty label. Informational only.
    pub difficulty: Option<String>,
    /// Command executed inside the sandbox; must exit 0 only on a full pass.
    pub verify_command: String,
    pub verify_source: VerifySource,
    /// Optional toolchain setup command run before verification. A failed
    /// setup aborts the verification with a reserved exit code.
    pub setup_command: Option<String>,
    pub sandbox: SandboxSpec,
    /// Optional directory whose contents seed the run workspace.
    pub seed_dir: Option<PathBuf>,
}

impl TaskDefinition {
    /// Configuration scope for this task: its task type, or the global scope.
    pub fn scope(&self) -> &str {
        self.task_type.as_deref().unwrap_or(GLOBAL_SCOPE)
    }

    pub fn validate(&self) -> Result<()> {
        validate_task_id(&self.id)?;
        if self.description.trim().is_empty() {
            bail!("task.description must be non-empty");
        }
        if self.verify_command.trim().is_empty() {
            bail!("verify.command must be non-empty");
        }
        if let Some(setup) = &self.setup_command
            && setup.trim().is_empty()
        {
            bail!("setup.command must be non-empty when present");
        }
        if self.sandbox.limits.timeout_secs == 0 {
            bail!("sandbox.timeout_secs must be > 0");
        }
        if self.sandbox.limits.memory_mb == 0 {
            bail!("sandbox.memory_mb must be > 0");
        }
        if self.sandbox.limits.cpus <= 0.0 {
            bail!("sandbox.cpus must be > 0");
        }
        Ok(())
    }
}

/// Scope key under which the default configuration pointer is tracked.
pub const GLOBAL_SCOPE: &str = "global";

fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("task.id must be non-empty");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_'))
    {
        bail!("task.id must match [a-z0-9_-]+ (got {id:?})");
    }
    Ok(())
}
