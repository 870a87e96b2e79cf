//! Pipeline Driver: runs one [`Job`] through compile -> compress -> protect, and
//! fans a batch of jobs out across a bounded pool of concurrent pipelines, mirroring
//! the teacher's `Solc::compile_many` (`buffer_unordered` over an iterator of async
//! compile futures).

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures_util::stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, Result};
use crate::job::{Job, PipelineReport};
use crate::registry::{ToolKind, ToolRegistry};
use crate::scheduler::compile::CompileBackend;
use crate::scheduler::compress::{run_compress, CompressBackend};

/// Restores `target` from a sibling backup copy unless [`BackupGuard::commit`] is
/// called first. Used around the compress stage, which overwrites the compiled
/// artifact in place: a failed or cancelled compression run must not leave a
/// half-written or missing artifact behind.
struct BackupGuard {
    backup_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl BackupGuard {
    fn create(target: &Path) -> std::io::Result<Self> {
        let backup_path = target.with_extension("freeze-bak");
        std::fs::copy(target, &backup_path)?;
        Ok(Self { backup_path, target: target.to_path_buf(), committed: false })
    }

    fn commit(mut self) {
        self.committed = true;
        let _ = std::fs::remove_file(&self.backup_path);
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::copy(&self.backup_path, &self.target) {
                tracing::warn!(error = %e, target = %self.target.display(), "backup restore failed");
            }
            let _ = std::fs::remove_file(&self.backup_path);
        }
    }
}

/// Owns the discovered tool registry and the backend lists every stage dispatches
/// over. Cheap to clone (the registry is `Arc`-shared); construct once per process.
#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<ToolRegistry>,
    compile_backends: Arc<Vec<Box<dyn CompileBackend>>>,
    compress_backends: Arc<Vec<Box<dyn CompressBackend>>>,
}

impl Pipeline {
    /// Probes every known tool once and builds a [`Pipeline`] ready to run jobs.
    pub async fn new() -> Self {
        Self {
            registry: Arc::new(ToolRegistry::discover().await),
            compile_backends: Arc::new(crate::scheduler::compile::all_backends()),
            compress_backends: Arc::new(crate::scheduler::compress::all_backends()),
        }
    }

    /// Runs the six-step sequence from the component design: validate input exists,
    /// create the output directory, compile (fail fast), optionally compress the
    /// compiled artifact in place under a [`BackupGuard`], then optionally protect
    /// the *original source* (not the compiled artifact — protection methods operate
    /// on Python source, compression on the native binary).
    #[tracing::instrument(skip(self, job, cancel), fields(job.artifact = %job.artifact_name))]
    pub async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<PipelineReport> {
        if !job.input_path.is_file() {
            return Err(BuildError::InputNotFound(job.input_path.clone()));
        }
        std::fs::create_dir_all(&job.output_dir)?;

        let compile_outcome = crate::scheduler::compile::run_compile(
            &self.compile_backends,
            self.registry.candidates(ToolKind::Compiler),
            job,
            cancel,
        )
        .await
        .map_err(BuildError::from)?;

        let mut report =
            PipelineReport { success: compile_outcome.success, compile: Some(compile_outcome), ..Default::default() };

        let Some(artifact_path) = report.compile.as_ref().and_then(|c| c.artifact_path.clone()) else {
            return Ok(report);
        };

        if job.compression_method != crate::job::CompressionMethod::None {
            let guard = if job.backup_original {
                Some(BackupGuard::create(&artifact_path)?)
            } else {
                None
            };

            let compress_outcome = run_compress(
                &self.compress_backends,
                self.registry.candidates(ToolKind::Compressor),
                job,
                &artifact_path,
                cancel,
            )
            .await
            .map_err(BuildError::from)?;

            match guard {
                Some(guard) if compress_outcome.success => guard.commit(),
                Some(_) => tracing::warn!("compression failed, restoring backed-up artifact"),
                None => {}
            }

            report.success &= compress_outcome.success;
            report.compress = Some(compress_outcome);
        }

        if !job.effective_obfuscation_methods().is_empty() {
            let protect_outcome = crate::scheduler::protect::run_protect(
                self.registry.candidates(ToolKind::Protector),
                job,
                &job.input_path,
                cancel,
            )
            .await;

            report.success &= protect_outcome.success;
            report.protect = Some(protect_outcome);
        }

        Ok(report)
    }

    /// Runs every job in `jobs` with up to `parallelism` pipelines in flight at
    /// once, via `buffer_unordered` over one future per job — the same shape as the
    /// teacher's `compile_many`. Detects output-path collisions across the whole
    /// batch before starting any job (each would otherwise race the others writing
    /// into the same `output_dir`/`artifact_name`). If any job in the batch has
    /// `stop_on_first_error` set, a shared flag is raised on the first failure and
    /// every job still queued short-circuits with [`BuildError::Cancelled`] instead
    /// of running to completion.
    pub async fn run_batch(&self, jobs: &[Job], parallelism: usize) -> Vec<Result<PipelineReport>> {
        if let Some(collision) = find_output_collision(jobs) {
            return jobs.iter().map(|_| Err(BuildError::OutputCollision(collision.clone()))).collect();
        }

        let draining = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let results = futures_util::stream::iter(jobs.iter().map(|job| {
            let pipeline = self.clone();
            let draining = draining.clone();
            let cancel = cancel.clone();
            async move {
                if draining.load(Ordering::SeqCst) {
                    return Err(BuildError::Cancelled);
                }
                let result = pipeline.run(job, &cancel).await;
                if job.stop_on_first_error && !matches!(result, Ok(PipelineReport { success: true, .. })) {
                    draining.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
                result
            }
        }))
        .buffer_unordered(parallelism.max(1))
        .collect::<Vec<_>>()
        .await;

        results
    }
}

fn find_output_collision(jobs: &[Job]) -> Option<PathBuf> {
    let mut seen = BTreeSet::new();
    for job in jobs {
        let candidate = job.output_dir.join(&job.artifact_name);
        if !seen.insert(candidate.clone()) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("freeze_compilers=debug").try_init();
    }

    #[test]
    fn detects_output_collision_across_jobs() {
        let a = Job::builder("a.py").output_dir("dist").artifact_name("app").build().unwrap();
        let b = Job::builder("b.py").output_dir("dist").artifact_name("app").build().unwrap();
        assert_eq!(find_output_collision(&[a, b]), Some(PathBuf::from("dist/app")));
    }

    #[test]
    fn no_collision_when_artifact_names_differ() {
        let a = Job::builder("a.py").output_dir("dist").artifact_name("app").build().unwrap();
        let b = Job::builder("b.py").output_dir("dist").artifact_name("other").build().unwrap();
        assert_eq!(find_output_collision(&[a, b]), None);
    }

    #[tokio::test]
    async fn run_fails_fast_when_input_missing() {
        init_tracing();
        let pipeline = Pipeline::new().await;
        let job = Job::builder("does-not-exist.py").build().unwrap();
        let cancel = CancellationToken::new();
        let err = pipeline.run(&job, &cancel).await.unwrap_err();
        assert!(matches!(err, BuildError::InputNotFound(_)));
    }
}
