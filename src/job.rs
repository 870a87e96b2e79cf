//! Immutable per-run job specification and the stage/report types that travel
//! alongside it.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

/// Compression backend selector for a [`Job`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    None,
    Auto,
    Upx,
    Lzma,
    Brotli,
    Adaptive,
}

/// Source-level protection intensity. Each level maps to a default method list;
/// see [`ProtectionLevel::default_methods`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    None,
    Basic,
    Intermediate,
    Advanced,
    Maximum,
}

/// One obfuscation method a protect-stage backend may apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationMethod {
    ExternalObfuscator,
    SelfObfuscator,
    BytecodeEncryptor,
    StringEncoding,
    ControlFlow,
}

impl ProtectionLevel {
    /// Default backend/method list for this level, overridden by [`Job::obfuscation_methods`]
    /// when the caller sets it explicitly.
    pub fn default_methods(self) -> Vec<ObfuscationMethod> {
        use ObfuscationMethod::*;
        match self {
            Self::None => vec![],
            Self::Basic => vec![BytecodeEncryptor],
            Self::Intermediate => vec![SelfObfuscator, StringEncoding],
            Self::Advanced => vec![SelfObfuscator, StringEncoding, ControlFlow],
            Self::Maximum => {
                vec![ExternalObfuscator, SelfObfuscator, BytecodeEncryptor, StringEncoding, ControlFlow]
            }
        }
    }
}

/// Immutable specification of one end-to-end build, constructed via [`JobBuilder`].
#[derive(Clone, Debug)]
pub struct Job {
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub artifact_name: String,
    pub windowed: bool,
    pub one_file: bool,
    pub optimize: bool,
    pub icon_path: Option<PathBuf>,
    pub excludes: BTreeSet<String>,
    pub forced_imports: BTreeSet<String>,
    pub preferred_compiler: Option<String>,
    pub compression_method: CompressionMethod,
    pub compression_level: u8,
    pub protection_level: ProtectionLevel,
    pub obfuscation_methods: Option<Vec<ObfuscationMethod>>,
    pub backup_original: bool,
    pub stop_on_first_error: bool,
    pub compile_timeout: Option<Duration>,
}

impl Job {
    pub fn builder(input_path: impl Into<PathBuf>) -> JobBuilder {
        JobBuilder::new(input_path)
    }

    /// Methods the protect stage should apply, honoring an explicit override over the
    /// level's default list.
    pub fn effective_obfuscation_methods(&self) -> Vec<ObfuscationMethod> {
        self.obfuscation_methods.clone().unwrap_or_else(|| self.protection_level.default_methods())
    }
}

/// Builder for [`Job`]. Every setter is `#[must_use]` and consumes `self`, matching the
/// teacher's `ProjectBuilder` convention.
#[derive(Clone, Debug)]
pub struct JobBuilder {
    input_path: PathBuf,
    output_dir: Option<PathBuf>,
    artifact_name: Option<String>,
    windowed: bool,
    one_file: bool,
    optimize: bool,
    icon_path: Option<PathBuf>,
    excludes: BTreeSet<String>,
    forced_imports: BTreeSet<String>,
    preferred_compiler: Option<String>,
    compression_method: CompressionMethod,
    compression_level: u8,
    protection_level: ProtectionLevel,
    obfuscation_methods: Option<Vec<ObfuscationMethod>>,
    backup_original: bool,
    stop_on_first_error: bool,
    compile_timeout: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum JobBuildError {
    #[error("compression level must be in 1..=9, got {0}")]
    InvalidCompressionLevel(u8),
}

impl JobBuilder {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: None,
            artifact_name: None,
            windowed: false,
            one_file: true,
            optimize: false,
            icon_path: None,
            excludes: BTreeSet::new(),
            forced_imports: BTreeSet::new(),
            preferred_compiler: None,
            compression_method: CompressionMethod::None,
            compression_level: 6,
            protection_level: ProtectionLevel::None,
            obfuscation_methods: None,
            backup_original: true,
            stop_on_first_error: false,
            compile_timeout: None,
        }
    }

    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn artifact_name(mut self, name: impl Into<String>) -> Self {
        self.artifact_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn windowed(mut self, windowed: bool) -> Self {
        self.windowed = windowed;
        self
    }

    #[must_use]
    pub fn one_file(mut self, one_file: bool) -> Self {
        self.one_file = one_file;
        self
    }

    #[must_use]
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    #[must_use]
    pub fn icon_path(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon_path = Some(icon.into());
        self
    }

    #[must_use]
    pub fn exclude(mut self, module: impl Into<String>) -> Self {
        self.excludes.insert(module.into());
        self
    }

    #[must_use]
    pub fn force_import(mut self, module: impl Into<String>) -> Self {
        self.forced_imports.insert(module.into());
        self
    }

    #[must_use]
    pub fn preferred_compiler(mut self, name: impl Into<String>) -> Self {
        self.preferred_compiler = Some(name.into());
        self
    }

    #[must_use]
    pub fn compression(mut self, method: CompressionMethod, level: u8) -> Self {
        self.compression_method = method;
        self.compression_level = level;
        self
    }

    #[must_use]
    pub fn protection_level(mut self, level: ProtectionLevel) -> Self {
        self.protection_level = level;
        self
    }

    #[must_use]
    pub fn obfuscation_methods(mut self, methods: Vec<ObfuscationMethod>) -> Self {
        self.obfuscation_methods = Some(methods);
        self
    }

    #[must_use]
    pub fn backup_original(mut self, backup: bool) -> Self {
        self.backup_original = backup;
        self
    }

    #[must_use]
    pub fn stop_on_first_error(mut self, stop: bool) -> Self {
        self.stop_on_first_error = stop;
        self
    }

    #[must_use]
    pub fn compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Job, JobBuildError> {
        if !(1..=9).contains(&self.compression_level) {
            return Err(JobBuildError::InvalidCompressionLevel(self.compression_level));
        }
        let artifact_name = self.artifact_name.unwrap_or_else(|| stem_of(&self.input_path));
        let output_dir = self.output_dir.unwrap_or_else(|| PathBuf::from("dist"));
        Ok(Job {
            input_path: self.input_path,
            output_dir,
            artifact_name,
            windowed: self.windowed,
            one_file: self.one_file,
            optimize: self.optimize,
            icon_path: self.icon_path,
            excludes: self.excludes,
            forced_imports: self.forced_imports,
            preferred_compiler: self.preferred_compiler,
            compression_method: self.compression_method,
            compression_level: self.compression_level,
            protection_level: self.protection_level,
            obfuscation_methods: self.obfuscation_methods,
            backup_original: self.backup_original,
            stop_on_first_error: self.stop_on_first_error,
            compile_timeout: self.compile_timeout,
        })
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("artifact").to_string()
}

/// Result of the compile stage.
#[derive(Clone, Debug)]
pub struct CompileOutcome {
    pub success: bool,
    pub artifact_path: Option<PathBuf>,
    pub wall_time: Duration,
    pub byte_size: u64,
    pub tool_name: String,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

/// Result of the compress stage.
#[derive(Clone, Debug)]
pub struct CompressOutcome {
    pub success: bool,
    pub original_size: u64,
    pub compressed_size: u64,
    pub wall_time: Duration,
    pub tool_name: String,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl CompressOutcome {
    /// `(orig - new) / orig`, per the data model.
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        (self.original_size as f64 - self.compressed_size as f64) / self.original_size as f64
    }
}

/// Result of the protect stage.
#[derive(Clone, Debug, Default)]
pub struct ProtectOutcome {
    pub success: bool,
    pub protected_files: std::collections::BTreeMap<PathBuf, PathBuf>,
    pub methods_applied: Vec<ObfuscationMethod>,
    pub wall_time: Duration,
    pub error: Option<String>,
}

/// Aggregate report for one [`Job`], accumulated by the [`crate::pipeline::Pipeline`].
#[derive(Clone, Debug, Default)]
pub struct PipelineReport {
    pub success: bool,
    pub compile: Option<CompileOutcome>,
    pub compress: Option<CompressOutcome>,
    pub protect: Option<ProtectOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_out_of_range_compression_level() {
        let err = Job::builder("app.py").compression(CompressionMethod::Lzma, 0).build().unwrap_err();
        assert!(matches!(err, JobBuildError::InvalidCompressionLevel(0)));
    }

    #[test]
    fn backup_original_defaults_to_true() {
        let job = Job::builder("app.py").build().unwrap();
        assert!(job.backup_original);
    }

    #[test]
    fn builder_derives_artifact_name_from_input_stem() {
        let job = Job::builder("/tmp/scripts/entry.py").build().unwrap();
        assert_eq!(job.artifact_name, "entry");
    }

    #[test]
    fn explicit_obfuscation_methods_override_protection_level_default() {
        let job = Job::builder("app.py")
            .protection_level(ProtectionLevel::Maximum)
            .obfuscation_methods(vec![ObfuscationMethod::StringEncoding])
            .build()
            .unwrap();
        assert_eq!(job.effective_obfuscation_methods(), vec![ObfuscationMethod::StringEncoding]);
    }

    #[test]
    fn protection_level_falls_back_to_its_default_methods() {
        let job = Job::builder("app.py").protection_level(ProtectionLevel::Intermediate).build().unwrap();
        assert_eq!(
            job.effective_obfuscation_methods(),
            vec![ObfuscationMethod::SelfObfuscator, ObfuscationMethod::StringEncoding]
        );
    }

    #[test]
    fn compress_outcome_ratio_is_fraction_saved() {
        let outcome = CompressOutcome {
            success: true,
            original_size: 100,
            compressed_size: 40,
            wall_time: Duration::default(),
            tool_name: "lzma".into(),
            artifact_path: None,
            error: None,
        };
        assert!((outcome.ratio() - 0.6).abs() < f64::EPSILON);
    }
}
