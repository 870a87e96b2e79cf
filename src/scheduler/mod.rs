//! Stage Scheduler: the shared capability-discovery/scoring/selection/execution
//! pattern instantiated once per stage kind (compile, compress, protect).

pub mod compile;
pub mod compress;
pub mod protect;

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::registry::ToolDescriptor;

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no tool available for this stage")]
    NoToolAvailable,
    #[error("{tool} exited with status {status}: {stderr}")]
    SubprocessFailure { tool: String, status: i32, stderr: String },
    #[error("{tool} timed out after {0:?}", .timeout)]
    Timeout { tool: String, timeout: Duration },
    #[error("{tool} exited successfully but produced no artifact at any candidate path")]
    ArtifactNotFound { tool: String },
    #[error("subprocess cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Spawns `cmd` and waits for it to exit, racing the wait against `cancel`. On
/// cancellation, sends a kill signal immediately and waits up to
/// [`KILL_GRACE_PERIOD`] for the process to actually exit before giving up;
/// cancellation is idempotent because [`tokio::process::Child::start_kill`] is.
pub async fn run_cancellable(
    mut cmd: Command,
    cancel: &CancellationToken,
) -> Result<std::process::Output, SchedulerError> {
    let mut child = cmd.spawn()?;
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    tokio::select! {
        status = child.wait() => {
            if let Some(mut s) = stdout { let _ = s.read_to_end(&mut stdout_buf).await; }
            if let Some(mut s) = stderr { let _ = s.read_to_end(&mut stderr_buf).await; }
            Ok(std::process::Output { status: status?, stdout: stdout_buf, stderr: stderr_buf })
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            drop(stdout.take());
            drop(stderr.take());
            Err(SchedulerError::Cancelled)
        }
    }
}

/// Picks the highest-scoring candidate. Ties break on the stable alphabetical order
/// the registry already stores candidates in (candidates must be pre-sorted by
/// name), per the component design's "stable order declared in the registry".
/// Highest-scoring candidate, first occurrence wins on ties — per the registry's
/// declared (alphabetical-by-name) order rather than `Iterator::max_by_key`'s
/// last-wins behavior.
pub fn pick_highest<'a, T>(candidates: &'a [T], score: impl Fn(&T) -> i32) -> Option<&'a T> {
    candidates.iter().rev().max_by_key(|c| score(c))
}

/// Narrows a tool-kind candidate list to those the registry reports available, and
/// (if the job names one explicitly) to that single preference.
pub fn filter_available<'a>(
    descriptors: &'a [ToolDescriptor],
    preferred: Option<&str>,
) -> Vec<&'a ToolDescriptor> {
    descriptors
        .iter()
        .filter(|d| d.available)
        .filter(|d| preferred.map_or(true, |p| d.name == p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_highest_breaks_ties_on_first_occurrence() {
        let candidates = vec!["alpha", "beta", "gamma"];
        let picked = pick_highest(&candidates, |_| 10);
        assert_eq!(picked, Some(&"alpha"));
    }
}
