//! Compile-stage backends: PyInstaller-like, Nuitka-like, cx-Freeze-like.
//!
//! Each backend owns its own command-line grammar and output locator, per the
//! component design — there is deliberately no shared "one true" argument builder.
//! The Nuitka locator in particular must stay a single unambiguous function: the
//! tool this component is modeled on has a shadowed, unreachable inner locator
//! definition for that backend, which this implementation does not replicate.

use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::process::Command;
use tokio::time::timeout;

use crate::job::{CompileOutcome, Job};
use crate::registry::ToolDescriptor;

use super::{pick_highest, SchedulerError};

/// Common shape every compile backend implements: a pure scoring function plus the
/// two tool-specific bits the scheduler cannot generalize (command line, locator).
pub trait CompileBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure, side-effect-free: `(job) -> [0, 100]`.
    fn score(&self, job: &Job) -> i32;

    fn build_command(&self, tool: &ToolDescriptor, job: &Job) -> Command;

    /// Candidate output paths in preference order; the scheduler returns the first
    /// that exists after the subprocess exits successfully.
    fn locate_output(&self, job: &Job) -> Vec<PathBuf>;
}

pub struct PyInstallerBackend;
pub struct NuitkaBackend;
pub struct CxFreezeBackend;

impl CompileBackend for PyInstallerBackend {
    fn name(&self) -> &'static str {
        "pyinstaller"
    }

    fn score(&self, job: &Job) -> i32 {
        let mut score = 70;
        score += 15; // broad compatibility
        score += 10; // ease of use
        if job.optimize {
            score -= 5;
        }
        score.clamp(0, 100)
    }

    fn build_command(&self, tool: &ToolDescriptor, job: &Job) -> Command {
        let mut cmd = Command::new(&tool.path);
        cmd.arg(&job.input_path).arg("--distpath").arg(&job.output_dir).arg("--noconfirm");
        cmd.arg(if job.one_file { "--onefile" } else { "--onedir" });
        cmd.arg(if job.windowed { "--windowed" } else { "--console" });
        if let Some(icon) = &job.icon_path {
            cmd.arg("--icon").arg(icon);
        }
        for excluded in &job.excludes {
            cmd.arg("--exclude-module").arg(excluded);
        }
        for forced in &job.forced_imports {
            cmd.arg("--hidden-import").arg(forced);
        }
        cmd.arg("--name").arg(&job.artifact_name);
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn locate_output(&self, job: &Job) -> Vec<PathBuf> {
        if job.one_file {
            vec![job.output_dir.join(&job.artifact_name)]
        } else {
            vec![
                job.output_dir.join(&job.artifact_name).join(&job.artifact_name),
                job.output_dir.join(&job.artifact_name),
            ]
        }
    }
}

impl CompileBackend for NuitkaBackend {
    fn name(&self) -> &'static str {
        "nuitka"
    }

    fn score(&self, job: &Job) -> i32 {
        let mut score = 85;
        if job.optimize {
            score += 10;
        }
        let any_obfuscation = job.protection_level != crate::job::ProtectionLevel::None;
        if any_obfuscation {
            score += 5;
        }
        score -= 5; // compatibility cost
        score.clamp(0, 100)
    }

    fn build_command(&self, tool: &ToolDescriptor, job: &Job) -> Command {
        let mut cmd = Command::new(&tool.path);
        cmd.arg(&job.input_path).arg("--output-dir").arg(&job.output_dir);
        if job.one_file {
            cmd.arg("--onefile");
        } else {
            cmd.arg("--standalone");
        }
        if !job.windowed {
            cmd.arg("--console-mode=force");
        }
        if job.optimize {
            cmd.arg("--lto=yes");
        }
        for excluded in &job.excludes {
            cmd.arg(format!("--nofollow-import-to={excluded}"));
        }
        for forced in &job.forced_imports {
            cmd.arg(format!("--include-module={forced}"));
        }
        cmd.arg(format!("--output-filename={}", job.artifact_name));
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    /// Single unambiguous locator: the `.bin`/platform-suffixed onefile artifact, or
    /// the standalone build's `<name>.dist/<name>` binary.
    fn locate_output(&self, job: &Job) -> Vec<PathBuf> {
        if job.one_file {
            vec![
                job.output_dir.join(&job.artifact_name),
                job.output_dir.join(format!("{}.bin", job.artifact_name)),
            ]
        } else {
            vec![job.output_dir.join(format!("{}.dist", job.artifact_name)).join(&job.artifact_name)]
        }
    }
}

impl CompileBackend for CxFreezeBackend {
    fn name(&self) -> &'static str {
        "cxfreeze"
    }

    fn score(&self, job: &Job) -> i32 {
        let mut score = 60;
        score += 5; // simplicity
        if job.protection_level != crate::job::ProtectionLevel::None {
            score -= 10; // obfuscation unsupported
        }
        score.clamp(0, 100)
    }

    fn build_command(&self, tool: &ToolDescriptor, job: &Job) -> Command {
        let mut cmd = Command::new(&tool.path);
        cmd.arg(&job.input_path).arg("--target-dir").arg(&job.output_dir);
        cmd.arg("--target-name").arg(&job.artifact_name);
        for excluded in &job.excludes {
            cmd.arg("--exclude-modules").arg(excluded);
        }
        for forced in &job.forced_imports {
            cmd.arg("--include-modules").arg(forced);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn locate_output(&self, job: &Job) -> Vec<PathBuf> {
        vec![job.output_dir.join(&job.artifact_name)]
    }
}

pub fn all_backends() -> Vec<Box<dyn CompileBackend>> {
    vec![Box::new(PyInstallerBackend), Box::new(NuitkaBackend), Box::new(CxFreezeBackend)]
}

/// Selects the highest-scoring available backend (honoring `job.preferred_compiler`),
/// invokes it, locates the artifact, and normalizes the result into a
/// [`CompileOutcome`].
#[tracing::instrument(skip(backends, tools, job, cancel), fields(job.artifact = %job.artifact_name))]
pub async fn run_compile(
    backends: &[Box<dyn CompileBackend>],
    tools: &[ToolDescriptor],
    job: &Job,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<CompileOutcome, SchedulerError> {
    let available: Vec<&Box<dyn CompileBackend>> = backends
        .iter()
        .filter(|b| tools.iter().any(|t| t.name == b.name() && t.available))
        .filter(|b| job.preferred_compiler.as_deref().map_or(true, |p| p == b.name()))
        .collect();

    let backend = pick_highest(&available, |b| b.score(job)).ok_or(SchedulerError::NoToolAvailable)?;
    let tool = tools.iter().find(|t| t.name == backend.name()).ok_or(SchedulerError::NoToolAvailable)?;

    tracing::debug!(tool = backend.name(), "scheduler.selected");

    let start = Instant::now();
    let cmd = backend.build_command(tool, job);

    let spawn_and_wait = super::run_cancellable(cmd, cancel);
    let output = match job.compile_timeout {
        Some(limit) => timeout(limit, spawn_and_wait)
            .await
            .map_err(|_| SchedulerError::Timeout { tool: backend.name().into(), timeout: limit })??,
        None => spawn_and_wait.await?,
    };

    let wall_time = start.elapsed();

    if !output.status.success() {
        return Err(SchedulerError::SubprocessFailure {
            tool: backend.name().into(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let artifact_path = backend.locate_output(job).into_iter().find(|p| p.exists());
    let Some(artifact_path) = artifact_path else {
        return Err(SchedulerError::ArtifactNotFound { tool: backend.name().into() });
    };

    let byte_size = std::fs::metadata(&artifact_path).map(|m| m.len()).unwrap_or(0);
    let warnings = String::from_utf8_lossy(&output.stderr)
        .lines()
        .filter(|l| l.to_lowercase().contains("warning"))
        .map(str::to_string)
        .collect();

    Ok(CompileOutcome {
        success: true,
        artifact_path: Some(artifact_path),
        wall_time,
        byte_size,
        tool_name: backend.name().into(),
        error: None,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::builder("entry.py").build().unwrap()
    }

    #[test]
    fn pyinstaller_scores_lower_with_optimize() {
        let base = PyInstallerBackend.score(&job());
        let optimized = PyInstallerBackend.score(&Job { optimize: true, ..job() });
        assert!(optimized < base);
    }

    #[test]
    fn nuitka_scores_higher_with_optimize() {
        let base = NuitkaBackend.score(&job());
        let optimized = NuitkaBackend.score(&Job { optimize: true, ..job() });
        assert!(optimized > base);
    }

    #[test]
    fn cxfreeze_penalizes_protection() {
        let base = CxFreezeBackend.score(&job());
        let protected =
            CxFreezeBackend.score(&Job { protection_level: crate::job::ProtectionLevel::Basic, ..job() });
        assert!(protected < base);
    }
}
