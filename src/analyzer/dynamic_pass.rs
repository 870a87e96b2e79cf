//! Dynamic pass: runs the entry program in an isolated subprocess with its import
//! hook replaced by a tracing shim, and collects every module root it actually
//! imported at runtime.
//!
//! The original tool this component is modeled on has the shim print `"IMPORTED:
//! <name>"` lines to standard output and parses the child's captured stdout. That is
//! fragile against any print the user program itself performs. This implementation
//! instead gives the shim a temp file path via an environment variable and has it
//! append one JSON line per import to that file; the parent reads the file after the
//! child exits, leaving the child's stdout/stderr untouched.

use std::{path::Path, time::Duration};

use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::time::timeout;

const TRACE_TIMEOUT: Duration = Duration::from_secs(30);
const TRACE_CHANNEL_ENV: &str = "FREEZE_IMPORT_TRACE_PATH";

/// Prepended to the entry program's source before it is executed, installing an
/// import hook that appends `{"root": "<name>"}` lines to the file named by
/// [`TRACE_CHANNEL_ENV`] for every module import.
const TRACE_SHIM: &str = r#"
import builtins as __freeze_builtins
import json as __freeze_json
import os as __freeze_os

__freeze_trace_path = __freeze_os.environ.get("FREEZE_IMPORT_TRACE_PATH")
__freeze_real_import = __freeze_builtins.__import__

def __freeze_traced_import(name, *args, **kwargs):
    if __freeze_trace_path:
        root = name.split(".")[0]
        with open(__freeze_trace_path, "a", encoding="utf-8") as __freeze_fh:
            __freeze_fh.write(__freeze_json.dumps({"root": root}) + "\n")
    return __freeze_real_import(name, *args, **kwargs)

__freeze_builtins.__import__ = __freeze_traced_import
"#;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace subprocess timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to spawn traced subprocess: {0}")]
    Spawn(#[source] std::io::Error),
}

/// One import root recorded by the tracing shim.
#[derive(Clone, Debug, serde::Deserialize)]
struct TraceLine {
    root: String,
}

/// Runs `entry_file` under the trace shim and returns every distinct module root it
/// imported. Per the component design, a non-zero exit or a timeout yields the empty
/// set rather than an error — the caller logs a warning and keeps the static pass's
/// result.
pub async fn trace_imports(
    python: &str,
    entry_file: &Path,
) -> Result<Vec<String>, TraceError> {
    let channel = NamedTempFile::new().map_err(TraceError::Spawn)?;
    let channel_path = channel.path().to_path_buf();

    let shim_file = NamedTempFile::with_suffix(".py").map_err(TraceError::Spawn)?;
    let entry_source = std::fs::read_to_string(entry_file).unwrap_or_default();
    std::fs::write(shim_file.path(), format!("{TRACE_SHIM}\n{entry_source}"))
        .map_err(TraceError::Spawn)?;

    let cwd = entry_file.parent().unwrap_or_else(|| Path::new("."));

    let run = async {
        Command::new(python)
            .arg(shim_file.path())
            .current_dir(cwd)
            .env(TRACE_CHANNEL_ENV, &channel_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .status()
            .await
    };

    let status = timeout(TRACE_TIMEOUT, run)
        .await
        .map_err(|_| TraceError::Timeout(TRACE_TIMEOUT))?
        .map_err(TraceError::Spawn)?;

    if !status.success() {
        tracing::warn!(?status, "traced subprocess exited non-zero; dynamic pass contributes nothing");
        return Ok(Vec::new());
    }

    let contents = std::fs::read_to_string(&channel_path).unwrap_or_default();
    let mut roots = Vec::new();
    for line in contents.lines() {
        if let Ok(parsed) = serde_json::from_str::<TraceLine>(line) {
            if !roots.contains(&parsed.root) {
                roots.push(parsed.root);
            }
        }
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_line_parses_from_json() {
        let line: TraceLine = serde_json::from_str(r#"{"root": "os"}"#).unwrap();
        assert_eq!(line.root, "os");
    }
}
