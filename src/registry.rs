//! Tool Registry: capability discovery for the three stage kinds.
//!
//! Built once per process and treated as read-only afterwards — callers pass it by
//! reference, never as a singleton.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;
use tokio::time::timeout;

/// The three stage kinds a [`ToolDescriptor`] can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolKind {
    Compiler,
    Compressor,
    Protector,
}

/// A single external tool: name, resolved path, reported version, availability.
///
/// Built once at registry init and treated as effectively immutable for the process
/// lifetime, per the data model.
#[derive(Clone, Debug)]
pub struct ToolDescriptor {
    pub kind: ToolKind,
    pub name: String,
    pub path: PathBuf,
    pub version: String,
    pub available: bool,
}

/// How to probe one known tool: the binary name searched on `PATH` and the argument
/// that makes it print a version string.
struct ProbeSpec {
    kind: ToolKind,
    name: &'static str,
    binary: &'static str,
    version_arg: &'static str,
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn known_probes() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec { kind: ToolKind::Compiler, name: "pyinstaller", binary: "pyinstaller", version_arg: "--version" },
        ProbeSpec { kind: ToolKind::Compiler, name: "nuitka", binary: "nuitka3", version_arg: "--version" },
        ProbeSpec { kind: ToolKind::Compiler, name: "cxfreeze", binary: "cxfreeze", version_arg: "--version" },
        ProbeSpec { kind: ToolKind::Compressor, name: "upx", binary: "upx", version_arg: "--version" },
        ProbeSpec { kind: ToolKind::Protector, name: "pyarmor", binary: "pyarmor", version_arg: "--version" },
    ]
}

/// Tools that never need a subprocess probe: they're implemented in-process (LZMA,
/// Brotli, the Adaptive compressor, the self-obfuscator, the bytecode encryptor) and
/// are available exactly when their backing crate feature is compiled in.
fn builtin_descriptors() -> Vec<ToolDescriptor> {
    let mut v = vec![
        ToolDescriptor {
            kind: ToolKind::Compressor,
            name: "lzma".into(),
            path: PathBuf::from("builtin"),
            version: env!("CARGO_PKG_VERSION").into(),
            available: true,
        },
        ToolDescriptor {
            kind: ToolKind::Compressor,
            name: "adaptive".into(),
            path: PathBuf::from("builtin"),
            version: env!("CARGO_PKG_VERSION").into(),
            available: true,
        },
        ToolDescriptor {
            kind: ToolKind::Protector,
            name: "self-obfuscator".into(),
            path: PathBuf::from("builtin"),
            version: env!("CARGO_PKG_VERSION").into(),
            available: true,
        },
        ToolDescriptor {
            kind: ToolKind::Protector,
            name: "bytecode-encryptor".into(),
            path: PathBuf::from("builtin"),
            version: env!("CARGO_PKG_VERSION").into(),
            available: true,
        },
    ];
    v.push(ToolDescriptor {
        kind: ToolKind::Compressor,
        name: "brotli".into(),
        path: PathBuf::from("builtin"),
        version: env!("CARGO_PKG_VERSION").into(),
        available: cfg!(feature = "brotli-compressor"),
    });
    v
}

/// Error raised internally by a probe call. Callers of [`ToolRegistry::discover`] never
/// see this — a timed-out or failing probe just yields an unavailable descriptor.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe for {0} timed out")]
    Timeout(String),
}

/// A read-only, process-lifetime cache of tool descriptors.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    by_kind: BTreeMap<ToolKind, Vec<ToolDescriptor>>,
}

impl ToolRegistry {
    /// Probes every known tool and builds the cache. Never fails: unavailable tools are
    /// represented as descriptors with `available: false`.
    #[tracing::instrument(skip_all)]
    pub async fn discover() -> Self {
        let mut by_kind: BTreeMap<ToolKind, Vec<ToolDescriptor>> = BTreeMap::new();

        for descriptor in builtin_descriptors() {
            by_kind.entry(descriptor.kind).or_default().push(descriptor);
        }

        for probe in known_probes() {
            let descriptor = match probe_tool(&probe).await {
                Ok(d) => {
                    tracing::debug!(tool = probe.name, available = d.available, "tool.probe");
                    d
                }
                Err(ProbeError::Timeout(_)) => {
                    tracing::debug!(tool = probe.name, "tool.probe timed out, marking unavailable");
                    unavailable(&probe)
                }
            };
            by_kind.entry(probe.kind).or_default().push(descriptor);
        }

        for list in by_kind.values_mut() {
            list.sort_by(|a, b| a.name.cmp(&b.name));
        }

        Self { by_kind }
    }

    /// Constant-time lookup into the cache.
    pub fn lookup(&self, kind: ToolKind, name: &str) -> Option<&ToolDescriptor> {
        self.by_kind.get(&kind)?.iter().find(|d| d.name == name)
    }

    /// All descriptors of a given kind, in the registry's stable (alphabetical) order.
    pub fn candidates(&self, kind: ToolKind) -> &[ToolDescriptor] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn unavailable(probe: &ProbeSpec) -> ToolDescriptor {
    ToolDescriptor {
        kind: probe.kind,
        name: probe.name.into(),
        path: PathBuf::from(probe.binary),
        version: String::new(),
        available: false,
    }
}

async fn probe_tool(probe: &ProbeSpec) -> Result<ToolDescriptor, ProbeError> {
    let run = async {
        let output = Command::new(probe.binary)
            .arg(probe.version_arg)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let version = parse_version_line(&output.stdout, &output.stderr);
                ToolDescriptor {
                    kind: probe.kind,
                    name: probe.name.into(),
                    path: PathBuf::from(probe.binary),
                    version,
                    available: true,
                }
            }
            _ => unavailable(probe),
        }
    };

    timeout(PROBE_TIMEOUT, run).await.map_err(|_| ProbeError::Timeout(probe.name.into()))
}

/// Extracts a version string from a tool's captured stdout/stderr, falling back to
/// stderr when stdout is empty (some tools print `--version` output there).
fn parse_version_line(stdout: &[u8], stderr: &[u8]) -> String {
    let text = if stdout.iter().any(|b| !b.is_ascii_whitespace()) { stdout } else { stderr };
    String::from_utf8_lossy(text).lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_version_from_stdout() {
        let v = parse_version_line(b"3.2.1\n", b"");
        assert_eq!(v, "3.2.1");
    }

    #[test]
    fn falls_back_to_stderr_when_stdout_empty() {
        let v = parse_version_line(b"", b"1.0.0-beta\n");
        assert_eq!(v, "1.0.0-beta");
    }

    #[tokio::test]
    async fn discover_never_fails_on_missing_binaries() {
        let registry = ToolRegistry::discover().await;
        let compilers = registry.candidates(ToolKind::Compiler);
        assert_eq!(compilers.len(), 3);
        assert!(compilers.iter().all(|d| !d.available));
    }

    #[tokio::test]
    async fn builtin_compressors_are_always_available_except_gated_brotli() {
        let registry = ToolRegistry::discover().await;
        let lzma = registry.lookup(ToolKind::Compressor, "lzma").unwrap();
        assert!(lzma.available);
    }
}
