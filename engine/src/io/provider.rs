//! Inference provider boundary.
//!
//! The [`Provider`] trait decouples the orchestration loop from the actual
//! inference backend. The production implementation spawns a configured
//! CLI, feeds the prompt on stdin, and validates the JSON reply against a
//! bundled schema. Tests use scripted providers that return predetermined
//! proposals without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::action::{ActionRequest, salvage_json};
use crate::io::process::run_command_with_timeout;

const ACTION_SCHEMA: &str = include_str!("../../schemas/action.schema.json");

/// One inference request.
#[derive(Debug, Clone)]
pub struct ProposeRequest {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// One inference reply: the proposed action plus the raw text it was
/// recovered from.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub action: ActionRequest,
    pub raw: String,
}

/// Abstraction over inference backends.
///
/// Implementations must be cheap to call from multiple sampler threads;
/// unavailability is surfaced as an error and treated by callers as a
/// retryable step failure, never a fatal run error.
pub trait Provider: Sync {
    fn propose(&self, request: &ProposeRequest) -> Result<Proposal>;
}

/// Provider that spawns a configured actor CLI.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    /// Command and leading arguments (e.g. `["actorctl", "propose"]`).
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Provider for CommandProvider {
    #[instrument(skip_all, fields(temperature = request.temperature))]
    fn propose(&self, request: &ProposeRequest) -> Result<Proposal> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("provider command must be non-empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--temperature")
            .arg(format!("{:.2}", request.temperature))
            .arg("--max-tokens")
            .arg(request.max_tokens.to_string());

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            None,
        )
        .context("run inference provider")?;

        if output.timed_out {
            bail!("inference provider timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "inference provider failed with status {:?}",
                output.status.code()
            );
        }

        let raw = output.stdout_lossy();
        let action = parse_proposal(&raw)?;
        debug!(action = %action.name, "provider proposed action");
        Ok(Proposal { action, raw })
    }
}

/// Parse and schema-validate a raw provider reply, salvaging structurally
/// damaged output before giving up.
pub fn parse_proposal(raw: &str) -> Result<ActionRequest> {
    let value = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(_) => {
            warn!("provider reply is not clean JSON, attempting salvage");
            salvage_json(raw).ok_or_else(|| anyhow!("unparseable provider reply"))?
        }
    };
    validate_action_schema(&value)?;
    serde_json::from_value(value).context("parse provider action")
}

fn validate_action_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(ACTION_SCHEMA).context("parse action schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile action schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("action schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
