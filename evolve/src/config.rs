//! Harness configuration stored in `evolve.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Harness configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolveConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Directory of task TOML files.
    pub tasks_dir: PathBuf,
    /// Directory under which run workspaces are created.
    pub workspaces_dir: PathBuf,
    /// Wall-clock budget per run in seconds.
    pub wall_clock_secs: u64,
    /// Prompt pack byte budget.
    pub prompt_budget_bytes: usize,

    pub provider: ProviderConfig,
    pub reasoner: ReasonerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Actor CLI command (e.g. `["actorctl", "propose"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: vec!["actorctl".to_string(), "propose".to_string()],
            timeout_secs: 120,
            max_tokens: 2048,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReasonerConfig {
    /// Reasoner CLI command.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Backoff attempts before falling back to "keep current".
    pub max_attempts: u32,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        Self {
            command: vec!["reasonctl".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 100_000,
            max_attempts: 3,
        }
    }
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("evolve.db"),
            tasks_dir: PathBuf::from("tasks"),
            workspaces_dir: PathBuf::from("workspaces"),
            wall_clock_secs: 30 * 60,
            prompt_budget_bytes: 40_000,
            provider: ProviderConfig::default(),
            reasoner: ReasonerConfig::default(),
        }
    }
}

impl EvolveConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wall_clock_secs == 0 {
            return Err(anyhow!("wall_clock_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        for (label, command) in [
            ("provider.command", &self.provider.command),
            ("reasoner.command", &self.reasoner.command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{label} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EvolveConfig::default()`.
pub fn load_config(path: &Path) -> Result<EvolveConfig> {
    if !path.exists() {
        let cfg = EvolveConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EvolveConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
