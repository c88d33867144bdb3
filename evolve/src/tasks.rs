//! Task catalog loading.
//!
//! Tasks are TOML files defining a description, a verification command,
//! and sandbox requirements. See `tasks/` for examples.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use engine::core::task::{ResourceLimits, SandboxSpec, TaskDefinition, VerifySource};
use serde::Deserialize;

/// A parsed task file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskFile {
    pub task: TaskMeta,
    pub verify: VerifySection,
    #[serde(default)]
    pub setup: Option<SetupSection>,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskMeta {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Directory (relative to the task file) whose contents seed the
    /// run workspace.
    #[serde(default)]
    pub seed_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifySection {
    pub command: String,
    /// `protected` or `self_generated`.
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupSection {
    pub command: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub image: Option<String>,
    pub recipe: Option<PathBuf>,
    pub cpus: Option<f64>,
    pub memory_mb: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl TaskFile {
    /// Load a task file and convert it into a validated [`TaskDefinition`].
    /// Relative recipe and seed paths resolve against the task file's
    /// directory.
    pub fn load(path: &Path) -> Result<TaskDefinition> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read task {}", path.display()))?;
        let file: TaskFile = toml::from_str(&contents)
            .with_context(|| format!("parse task {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        file.into_definition(base)
            .with_context(|| format!("validate task {}", path.display()))
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str, base: &Path) -> Result<TaskDefinition> {
        let file: TaskFile = toml::from_str(contents).context("parse task")?;
        file.into_definition(base)
    }

    fn into_definition(self, base: &Path) -> Result<TaskDefinition> {
        let source = match self.verify.source.as_str() {
            "protected" => VerifySource::Protected,
            "self_generated" | "self" => VerifySource::SelfGenerated,
            other => bail!("verify.source must be 'protected' or 'self_generated' (got {other:?})"),
        };
        let defaults = ResourceLimits::default();
        let definition = TaskDefinition {
            id: self.task.id,
            description: self.task.description,
            task_type: self.task.task_type,
            difficulty: self.task.difficulty,
            verify_command: self.verify.command,
            verify_source: source,
            setup_command: self.setup.map(|s| s.command),
            sandbox: SandboxSpec {
                image: self.sandbox.image,
                recipe: self.sandbox.recipe.map(|r| resolve(base, r)),
                limits: ResourceLimits {
                    cpus: self.sandbox.cpus.unwrap_or(defaults.cpus),
                    memory_mb: self.sandbox.memory_mb.unwrap_or(defaults.memory_mb),
                    timeout_secs: self.sandbox.timeout_secs.unwrap_or(defaults.timeout_secs),
                },
            },
            seed_dir: self.task.seed_dir.map(|s| resolve(base, s)),
        };
        definition.validate()?;
        Ok(definition)
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Discover all task files under a directory, sorted by id.
pub fn discover_tasks(dir: &Path) -> Result<Vec<TaskDefinition>> {
    if !dir.exists() {
        bail!("tasks directory {} does not exist", dir.display());
    }
    let mut tasks = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "toml") {
            tasks.push(TaskFile::load(&path)?);
        }
    }
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}

/// Find one task by id.
pub fn find_task(dir: &Path, task_id: &str) -> Result<TaskDefinition> {
    let direct = dir.join(format!("{task_id}.toml"));
    if direct.exists() {
        return TaskFile::load(&direct);
    }
    let tasks = discover_tasks(dir)?;
    tasks
        .into_iter()
        .find(|task| task.id == task_id)
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found under {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[task]
id = "date-matcher"
description = "Write a 4-digit-year date matcher"
task_type = "refine"

[verify]
command = "pytest -q"
source = "protected"

[setup]
command = "pip install pytest"

[sandbox]
image = "bench-python:3.11"
memory_mb = 512
timeout_secs = 90
"#;

    #[test]
    fn parses_full_task_file() {
        let task = TaskFile::parse_str(SAMPLE, Path::new("/tasks")).expect("parse");
        assert_eq!(task.id, "date-matcher");
        assert_eq!(task.verify_source, VerifySource::Protected);
        assert_eq!(task.setup_command.as_deref(), Some("pip install pytest"));
        assert_eq!(task.sandbox.image.as_deref(), Some("bench-python:3.11"));
        assert_eq!(task.sandbox.limits.memory_mb, 512);
        assert_eq!(task.sandbox.limits.timeout_secs, 90);
        // Unspecified limits keep defaults.
        assert!(task.sandbox.limits.cpus > 0.0);
    }

    #[test]
    fn rejects_unknown_source() {
        let bad = SAMPLE.replace("\"protected\"", "\"secret\"");
        assert!(TaskFile::parse_str(&bad, Path::new("/tasks")).is_err());
    }

    #[test]
    fn relative_paths_resolve_against_task_dir() {
        let contents = r#"
[task]
id = "seeded"
description = "seeded task"
seed_dir = "seeds/seeded"

[verify]
command = "true"
source = "self_generated"

[sandbox]
recipe = "images/base.dockerfile"
"#;
        let task = TaskFile::parse_str(contents, Path::new("/tasks")).expect("parse");
        assert_eq!(
            task.seed_dir.as_deref(),
            Some(Path::new("/tasks/seeds/seeded"))
        );
        assert_eq!(
            task.sandbox.recipe.as_deref(),
            Some(Path::new("/tasks/images/base.dockerfile"))
        );
    }

    #[test]
    fn discovers_tasks_sorted_by_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        for id in ["zeta", "alpha"] {
            let contents = format!(
                "[task]\nid = \"{id}\"\ndescription = \"task {id}\"\n\n\
                 [verify]\ncommand = \"true\"\nsource = \"self_generated\"\n"
            );
            fs::write(temp.path().join(format!("{id}.toml")), contents).expect("write");
        }
        let tasks = discover_tasks(temp.path()).expect("discover");
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);

        let found = find_task(temp.path(), "alpha").expect("find");
        assert_eq!(found.id, "alpha");
        assert!(find_task(temp.path(), "missing").is_err());
    }
}
