//! Sandboxed verification inside an ephemeral, resource-limited container.
//!
//! The verifier resolves an execution image through a three-tier strategy
//! (pinned reference, build recipe, generic baseline), copies the workspace
//! into an ephemeral mount, runs an optional toolchain setup gate followed
//! by the task's verification command, and parses structured pass/fail
//! counts from the output after an explicit marker. Exit without parseable
//! counts is reported as 0/0 — a broken harness, distinct from "ran and
//! some checks failed".

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::task::{TaskDefinition, VerifySource};
use crate::core::verify::{
    CheckCounts, FailureDetail, ProtectedReport, SelfReport, Verdict,
};
use crate::io::process::run_command_with_timeout;
use crate::io::workspace::{copy_dir, remove_dir_best_effort};

/// Image used when neither a pinned reference nor a recipe is usable.
pub const BASELINE_IMAGE: &str = "debian:bookworm-slim";

/// Marker emitted just before the verification command runs; only output
/// after the last occurrence is parsed, so setup/install noise never
/// reaches the count parser.
pub const OUTPUT_MARKER: &str = "-----VERIFY-OUTPUT-----";

/// Reserved exit code for a failed toolchain setup.
const SETUP_FAILED_EXIT: i32 = 96;

const DOCKER_OUTPUT_LIMIT: usize = 200_000;

/// Unrecoverable sandbox condition: no usable execution image, or no
/// container runtime at all. Distinct from per-execution failures, which
/// surface as broken-harness verdicts and do not end the run.
#[derive(Debug)]
pub struct FatalSandboxError {
    pub reason: String,
}

impl fmt::Display for FatalSandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal sandbox error: {}", self.reason)
    }
}

impl std::error::Error for FatalSandboxError {}

/// Abstraction over verification backends.
pub trait Verifier: Sync {
    /// Verify `workspace` against the task's check suite.
    ///
    /// Per-execution problems (container crash, timeout, unparseable
    /// output) return an `Ok` broken-harness verdict; only unrecoverable
    /// conditions return an error, carrying [`FatalSandboxError`].
    fn verify(&self, workspace: &Path, task: &TaskDefinition, cancel: &CancelToken)
    -> Result<Verdict>;
}

/// Verifier backed by the docker CLI.
pub struct DockerVerifier {
    docker_bin: String,
    /// Resolved image per task id, so the three-tier resolution runs once.
    image_cache: Mutex<HashMap<String, String>>,
}

impl Default for DockerVerifier {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerVerifier {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            image_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the execution image for a task: pinned reference first,
    /// build recipe second, generic baseline last. Failure of all tiers is
    /// fatal.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn resolve_image(&self, task: &TaskDefinition) -> Result<String> {
        if let Some(cached) = self
            .image_cache
            .lock()
            .expect("image cache lock")
            .get(&task.id)
        {
            return Ok(cached.clone());
        }

        self.ensure_daemon()?;

        let resolved = self
            .try_pinned(task)
            .or_else(|| self.try_recipe(task))
            .or_else(|| self.try_baseline());
        let image = resolved.ok_or_else(|| {
            anyhow!(FatalSandboxError {
                reason: format!("no usable execution image for task {}", task.id),
            })
        })?;

        info!(image = %image, "resolved execution image");
        self.image_cache
            .lock()
            .expect("image cache lock")
            .insert(task.id.clone(), image.clone());
        Ok(image)
    }

    fn ensure_daemon(&self) -> Result<()> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        let output = run_command_with_timeout(cmd, None, Duration::from_secs(10), 4_096, None);
        match output {
            Ok(out) if out.status.success() => Ok(()),
            _ => Err(anyhow!(FatalSandboxError {
                reason: "container runtime unavailable".to_string(),
            })),
        }
    }

    fn try_pinned(&self, task: &TaskDefinition) -> Option<String> {
        let image = task.sandbox.image.as_deref()?;
        if self.docker_ok(&["image", "inspect", image], Duration::from_secs(15))
            || self.docker_ok(&["pull", image], Duration::from_secs(300))
        {
            return Some(image.to_string());
        }
        warn!(image, "pinned image unreachable, falling back");
        None
    }

    fn try_recipe(&self, task: &TaskDefinition) -> Option<String> {
        let recipe = task.sandbox.recipe.as_deref()?;
        if !recipe.exists() {
            warn!(recipe = %recipe.display(), "recipe missing, falling back");
            return None;
        }
        let tag = format!("engine-verify-{}", task.id);
        let build_dir = recipe.parent().unwrap_or_else(|| Path::new("."));
        let args = [
            "build",
            "-t",
            tag.as_str(),
            "-f",
            recipe.to_str()?,
            build_dir.to_str()?,
        ];
        if self.docker_ok(&args, Duration::from_secs(600)) {
            return Some(tag);
        }
        warn!(recipe = %recipe.display(), "recipe build failed, falling back");
        None
    }

    fn try_baseline(&self) -> Option<String> {
        if self.docker_ok(
            &["image", "inspect", BASELINE_IMAGE],
            Duration::from_secs(15),
        ) || self.docker_ok(&["pull", BASELINE_IMAGE], Duration::from_secs(300))
        {
            return Some(BASELINE_IMAGE.to_string());
        }
        None
    }

    fn docker_ok(&self, args: &[&str], timeout: Duration) -> bool {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(args);
        match run_command_with_timeout(cmd, None, timeout, DOCKER_OUTPUT_LIMIT, None) {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    fn remove_container(&self, name: &str) {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["rm", "-f", name]);
        let _ = run_command_with_timeout(cmd, None, Duration::from_secs(20), 4_096, None);
    }
}

impl Verifier for DockerVerifier {
    #[instrument(skip_all, fields(task_id = %task.id, workspace = %workspace.display()))]
    fn verify(
        &self,
        workspace: &Path,
        task: &TaskDefinition,
        cancel: &CancelToken,
    ) -> Result<Verdict> {
        let image = self.resolve_image(task)?;
        let start = Instant::now();

        // The authoritative workspace is never mounted; verification runs
        // against an ephemeral copy.
        let suffix = unique_suffix();
        let mount = ephemeral_mount_path(workspace, &suffix)?;
        copy_dir(workspace, &mount).context("copy workspace for verification")?;

        let container = format!("engine-verify-{suffix}");
        let mount_abs = mount
            .canonicalize()
            .with_context(|| format!("canonicalize {}", mount.display()))?;

        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(docker_run_args(
            &container,
            &mount_abs,
            &image,
            task,
        ));

        let timeout = Duration::from_secs(task.sandbox.limits.timeout_secs);
        let result = run_command_with_timeout(
            cmd,
            None,
            timeout,
            DOCKER_OUTPUT_LIMIT,
            Some(cancel),
        );
        let duration_ms = start.elapsed().as_millis() as u64;

        let verdict = match result {
            Ok(output) => {
                if output.timed_out || output.cancelled {
                    self.remove_container(&container);
                }
                debug!(exit_code = ?output.exit_code(), duration_ms, "verification finished");
                parse_check_output(
                    &output.combined_lossy(),
                    output.exit_code(),
                    task.verify_source,
                    duration_ms,
                )
            }
            Err(err) => {
                warn!(err = %err, "verification container failed to run");
                self.remove_container(&container);
                broken_verdict(task.verify_source, None, duration_ms)
            }
        };

        remove_dir_best_effort(&mount);
        Ok(verdict)
    }
}

/// Arguments for the verification `docker run` invocation.
fn docker_run_args(
    container: &str,
    mount: &Path,
    image: &str,
    task: &TaskDefinition,
) -> Vec<String> {
    let limits = &task.sandbox.limits;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container.to_string(),
        "--memory".to_string(),
        format!("{}m", limits.memory_mb),
        "--cpus".to_string(),
        format!("{}", limits.cpus),
        "-v".to_string(),
        format!("{}:/work", mount.display()),
        "-w".to_string(),
        "/work".to_string(),
        "-e".to_string(),
        format!("VERIFY_CMD={}", task.verify_command),
    ];
    if let Some(setup) = &task.setup_command {
        args.push("-e".to_string());
        args.push(format!("SETUP_CMD={setup}"));
    }
    args.push(image.to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(verify_script());
    args
}

/// Shell script executed inside the container. The toolchain setup gate
/// aborts with a reserved exit code on failure; the marker separates setup
/// noise from parseable verification output.
fn verify_script() -> String {
    format!(
        "set -u\n\
         if [ -n \"${{SETUP_CMD:-}}\" ]; then\n\
           if ! sh -c \"$SETUP_CMD\" >/tmp/setup.log 2>&1; then\n\
             echo '[setup failed]'\n\
             exit {SETUP_FAILED_EXIT}\n\
           fi\n\
         fi\n\
         echo '{OUTPUT_MARKER}'\n\
         exec sh -c \"$VERIFY_CMD\"\n"
    )
}

/// Parse verification output into a provenance-appropriate verdict.
///
/// Only text after the last [`OUTPUT_MARKER`] is considered. Recognized
/// count formats: `N passed` / `N failed` summaries and `K/T checks`.
/// Exit 0 with no counts means the command's own contract held (it exits 0
/// only on a full pass) and counts as 1/1; nonzero exit with no counts is
/// a broken harness.
pub fn parse_check_output(
    output: &str,
    exit_code: Option<i32>,
    source: VerifySource,
    duration_ms: u64,
) -> Verdict {
    let relevant = output
        .rfind(OUTPUT_MARKER)
        .map(|pos| &output[pos + OUTPUT_MARKER.len()..])
        .unwrap_or(output);

    if exit_code == Some(SETUP_FAILED_EXIT) {
        return broken_verdict(source, exit_code, duration_ms);
    }
    let Some(exit) = exit_code else {
        // Timed out or cancelled: no checks completed.
        return broken_verdict(source, None, duration_ms);
    };

    let counts = parse_counts(relevant);
    let Some((passing, failed)) = counts else {
        return if exit == 0 {
            build_verdict(source, true, CheckCounts::new(1, 1), Vec::new(), exit_code, duration_ms)
        } else {
            broken_verdict(source, exit_code, duration_ms)
        };
    };

    let total = passing + failed;
    let passed = exit == 0 && failed == 0 && total > 0;
    let failures = if failed > 0 {
        parse_failing_checks(relevant)
    } else {
        Vec::new()
    };
    build_verdict(
        source,
        passed,
        CheckCounts::new(passing, total),
        failures,
        exit_code,
        duration_ms,
    )
}

fn parse_counts(output: &str) -> Option<(u32, u32)> {
    let passed_re = Regex::new(r"(\d+)\s+passed").expect("passed regex");
    let failed_re = Regex::new(r"(\d+)\s+failed").expect("failed regex");
    let ratio_re = Regex::new(r"(\d+)/(\d+)\s+checks?").expect("ratio regex");

    if let Some(caps) = ratio_re.captures(output) {
        let passing: u32 = caps[1].parse().unwrap_or(0);
        let total: u32 = caps[2].parse().unwrap_or(0);
        return Some((passing, total.saturating_sub(passing)));
    }

    let passing = passed_re
        .captures(output)
        .and_then(|caps| caps[1].parse().ok());
    let failed = failed_re
        .captures(output)
        .and_then(|caps| caps[1].parse().ok());
    match (passing, failed) {
        (None, None) => None,
        (p, f) => Some((p.unwrap_or(0), f.unwrap_or(0))),
    }
}

fn parse_failing_checks(output: &str) -> Vec<FailureDetail> {
    let failed_line_re =
        Regex::new(r"(?m)^FAILED\s+(\S+?)(?:\s+-\s+(.+))?$").expect("failed line regex");
    let assert_re =
        Regex::new(r"Expected\s+(\[.+?\]),\s+but\s+got\s+(\[.+?\])").expect("assert regex");

    let mut failures: Vec<FailureDetail> = failed_line_re
        .captures_iter(output)
        .map(|caps| {
            let full = caps[1].to_string();
            let name = full.rsplit("::").next().unwrap_or(&full).to_string();
            FailureDetail {
                name,
                message: caps
                    .get(2)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_else(|| "check failed".to_string()),
                expected: None,
                actual: None,
            }
        })
        .collect();

    for caps in assert_re.captures_iter(output) {
        if let Some(last) = failures.last_mut()
            && last.expected.is_none()
        {
            last.expected = Some(caps[1].to_string());
            last.actual = Some(caps[2].to_string());
        }
    }

    failures
}

fn build_verdict(
    source: VerifySource,
    passed: bool,
    counts: CheckCounts,
    failures: Vec<FailureDetail>,
    exit_code: Option<i32>,
    duration_ms: u64,
) -> Verdict {
    match source {
        VerifySource::SelfGenerated => Verdict::SelfChecked(SelfReport {
            passed,
            counts,
            failures,
            exit_code,
            duration_ms,
        }),
        VerifySource::Protected => {
            let failing = counts.total.saturating_sub(counts.passing);
            let feedback = if passed {
                String::new()
            } else {
                format!("{failing} of {} checks are failing.", counts.total)
            };
            Verdict::Protected(ProtectedReport::new(
                passed,
                counts,
                failures.into_iter().map(|f| f.name).collect(),
                feedback,
                exit_code,
                duration_ms,
            ))
        }
    }
}

fn broken_verdict(source: VerifySource, exit_code: Option<i32>, duration_ms: u64) -> Verdict {
    build_verdict(
        source,
        false,
        CheckCounts::new(0, 0),
        Vec::new(),
        exit_code,
        duration_ms,
    )
}

fn ephemeral_mount_path(workspace: &Path, suffix: &str) -> Result<PathBuf> {
    let name = workspace
        .file_name()
        .ok_or_else(|| anyhow!("workspace {} has no name", workspace.display()))?
        .to_string_lossy()
        .to_string();
    let parent = workspace
        .parent()
        .ok_or_else(|| anyhow!("workspace {} has no parent", workspace.display()))?;
    Ok(parent.join(format!("{name}.verify{suffix}")))
}

fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:x}{:x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::SandboxSpec;

    fn task(source: VerifySource) -> TaskDefinition {
        TaskDefinition {
            id: "t".to_string(),
            description: "d".to_string(),
            task_type: None,
            difficulty: None,
            verify_command: "pytest -q".to_string(),
            verify_source: source,
            setup_command: Some("pip install pytest".to_string()),
            sandbox: SandboxSpec::default(),
            seed_dir: None,
        }
    }

    #[test]
    fn parses_pytest_style_counts() {
        let output = format!("{OUTPUT_MARKER}\n..F.\n3 passed, 1 failed in 0.2s\n");
        let verdict =
            parse_check_output(&output, Some(1), VerifySource::SelfGenerated, 10);
        assert_eq!(verdict.counts(), CheckCounts::new(3, 4));
        assert!(!verdict.passed());
        assert!((verdict.progress() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn parses_ratio_counts() {
        let output = format!("{OUTPUT_MARKER}\n7/10 checks passing\n");
        let verdict = parse_check_output(&output, Some(1), VerifySource::Protected, 10);
        assert_eq!(verdict.counts(), CheckCounts::new(7, 10));
    }

    #[test]
    fn noise_before_marker_is_ignored() {
        let output = format!(
            "installing... 99 passed fake banner\n{OUTPUT_MARKER}\n2 passed, 2 failed\n"
        );
        let verdict =
            parse_check_output(&output, Some(1), VerifySource::SelfGenerated, 10);
        assert_eq!(verdict.counts(), CheckCounts::new(2, 4));
    }

    #[test]
    fn exit_zero_without_counts_is_a_pass() {
        let output = format!("{OUTPUT_MARKER}\nall good\n");
        let verdict =
            parse_check_output(&output, Some(0), VerifySource::SelfGenerated, 10);
        assert!(verdict.passed());
        assert_eq!(verdict.counts(), CheckCounts::new(1, 1));
    }

    #[test]
    fn nonzero_exit_without_counts_is_broken_harness() {
        let output = format!("{OUTPUT_MARKER}\nsh: pytest: not found\n");
        let verdict = parse_check_output(&output, Some(127), VerifySource::Protected, 10);
        assert!(verdict.harness_broken());
        assert_eq!(verdict.counts().total, 0);
    }

    #[test]
    fn setup_failure_is_broken_harness_not_a_logic_failure() {
        let verdict = parse_check_output(
            "[setup failed]",
            Some(SETUP_FAILED_EXIT),
            VerifySource::SelfGenerated,
            10,
        );
        assert!(verdict.harness_broken());
    }

    #[test]
    fn timeout_is_broken_harness() {
        let verdict = parse_check_output("", None, VerifySource::Protected, 10);
        assert!(verdict.harness_broken());
    }

    #[test]
    fn self_generated_failures_carry_detail() {
        let output = format!(
            "{OUTPUT_MARKER}\nFAILED tests/test_dates.py::test_year - AssertionError\n\
             Expected [2024], but got [24]\n1 passed, 1 failed\n"
        );
        let verdict =
            parse_check_output(&output, Some(1), VerifySource::SelfGenerated, 10);
        let Verdict::SelfChecked(report) = verdict else {
            panic!("expected self-checked verdict");
        };
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "test_year");
        assert_eq!(report.failures[0].expected.as_deref(), Some("[2024]"));
    }

    #[test]
    fn protected_failures_carry_names_only() {
        let output = format!(
            "{OUTPUT_MARKER}\nFAILED tests/test_dates.py::test_year - AssertionError\n\
             Expected [2024], but got [24]\n1 passed, 1 failed\n"
        );
        let verdict = parse_check_output(&output, Some(1), VerifySource::Protected, 10);
        let Verdict::Protected(report) = verdict else {
            panic!("expected protected verdict");
        };
        assert_eq!(report.failing_checks, vec!["test_year".to_string()]);
        assert!(!report.feedback.contains("2024"));
    }

    #[test]
    fn run_args_include_limits_and_setup_env() {
        let task = task(VerifySource::Protected);
        let args = docker_run_args(
            "engine-verify-1",
            Path::new("/tmp/ws.verify1"),
            "bench:latest",
            &task,
        );
        let joined = args.join(" ");
        assert!(joined.contains("--memory 1024m"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("-v /tmp/ws.verify1:/work"));
        assert!(joined.contains("SETUP_CMD=pip install pytest"));
        assert!(joined.contains("VERIFY_CMD=pytest -q"));
        assert!(args.last().expect("script").contains(OUTPUT_MARKER));
    }

    #[test]
    fn script_gates_setup_before_marker() {
        let script = verify_script();
        let setup_pos = script.find("SETUP_CMD").expect("setup");
        let marker_pos = script.find(OUTPUT_MARKER).expect("marker");
        let verify_pos = script.find("VERIFY_CMD").expect("verify");
        assert!(setup_pos < marker_pos && marker_pos < verify_pos);
        assert!(script.contains(&format!("exit {SETUP_FAILED_EXIT}")));
    }
}
