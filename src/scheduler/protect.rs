//! Protect-stage backends: External-obfuscator-like (subprocess), Self-obfuscator
//! (in-process AST transforms, see [`crate::obfuscate`]), and Bytecode-encryptor
//! (AES-GCM with a PBKDF2-derived key). Methods are applied in the job's declared
//! order, each consuming the previous stage's output file, per the component design.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tokio::process::Command;
use tokio::time::timeout;

use crate::job::{Job, ObfuscationMethod, ProtectOutcome};
use crate::obfuscate::obfuscate_source;
use crate::registry::ToolDescriptor;

use super::SchedulerError;

const PROTECT_TIMEOUT: Duration = Duration::from_secs(600);
const PBKDF2_ITERATIONS: u32 = 10_000;
const SALT_LEN: usize = 16;
const IF_PROBABILITY: f64 = 0.3;
const FOR_PROBABILITY: f64 = 0.2;

#[derive(Debug, thiserror::Error)]
pub enum ProtectError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("obfuscation failed: {0}")]
    Obfuscate(#[from] crate::obfuscate::ObfuscateError),
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

/// Applies every method in `job.effective_obfuscation_methods()` in order, each
/// consuming the previous stage's output, and records the resulting map of
/// original source path -> protected path.
#[tracing::instrument(skip(tools, job, cancel), fields(job.artifact = %job.artifact_name))]
pub async fn run_protect(
    tools: &[ToolDescriptor],
    job: &Job,
    source_path: &Path,
    cancel: &tokio_util::sync::CancellationToken,
) -> ProtectOutcome {
    let start = Instant::now();
    let methods = job.effective_obfuscation_methods();
    if methods.is_empty() {
        return ProtectOutcome { success: true, wall_time: start.elapsed(), ..Default::default() };
    }

    let mut current = source_path.to_path_buf();
    let mut methods_applied = Vec::new();

    for method in methods {
        let result = match method {
            ObfuscationMethod::ExternalObfuscator => apply_external(tools, job, &current, cancel).await,
            ObfuscationMethod::SelfObfuscator => apply_self_obfuscator(&current, false, false),
            ObfuscationMethod::StringEncoding => apply_self_obfuscator(&current, true, false),
            ObfuscationMethod::ControlFlow => apply_self_obfuscator(&current, false, true),
            ObfuscationMethod::BytecodeEncryptor => apply_bytecode_encryptor(&current),
        };

        match result {
            Ok(next) => {
                current = next;
                methods_applied.push(method);
            }
            Err(e) => {
                tracing::warn!(?method, error = %e, "protect stage method failed");
                return ProtectOutcome {
                    success: false,
                    protected_files: Default::default(),
                    methods_applied,
                    wall_time: start.elapsed(),
                    error: Some(e.to_string()),
                };
            }
        }
    }

    let mut protected_files = std::collections::BTreeMap::new();
    protected_files.insert(source_path.to_path_buf(), current);

    ProtectOutcome { success: true, protected_files, methods_applied, wall_time: start.elapsed(), error: None }
}

async fn apply_external(
    tools: &[ToolDescriptor],
    job: &Job,
    current: &Path,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<PathBuf, ProtectError> {
    let tool = tools
        .iter()
        .find(|t| t.name == "pyarmor" && t.available)
        .ok_or(SchedulerError::NoToolAvailable)?;

    let out_dir = job.output_dir.join("protected");
    let mut cmd = Command::new(&tool.path);
    cmd.arg("obfuscate").arg("--output-dir").arg(&out_dir).arg(current);
    if job.protection_level == crate::job::ProtectionLevel::Maximum {
        cmd.arg("--advanced").arg("1").arg("--restrict").arg("1");
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = timeout(PROTECT_TIMEOUT, super::run_cancellable(cmd, cancel))
        .await
        .map_err(|_| SchedulerError::Timeout { tool: "pyarmor".into(), timeout: PROTECT_TIMEOUT })??;

    if !output.status.success() {
        return Err(SchedulerError::SubprocessFailure {
            tool: "pyarmor".into(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }

    let file_name = current.file_name().ok_or_else(|| ProtectError::Encrypt("input has no file name".into()))?;
    Ok(out_dir.join(file_name))
}

fn apply_self_obfuscator(current: &Path, strings_only: bool, control_flow_only: bool) -> Result<PathBuf, ProtectError> {
    let source = std::fs::read_to_string(current)?;
    let mut rng = rand::thread_rng();

    let obfuscated = if strings_only {
        crate::obfuscate::encode_strings(&source)?
    } else if control_flow_only {
        crate::obfuscate::add_control_flow_noise(&source, &mut rng, IF_PROBABILITY, FOR_PROBABILITY)?
    } else {
        obfuscate_source(&source, &mut rng, 0.0, 0.0)?
    };

    let out_path = current.with_extension("obfuscated.py");
    std::fs::write(&out_path, obfuscated)?;
    Ok(out_path)
}

/// Compiles (conceptually; here: reads) the current source, derives a key via
/// PBKDF2-HMAC-SHA256 from a random passphrase and a fresh random salt, encrypts
/// with AES-256-GCM, and writes a small loader embedding the salt/nonce/ciphertext
/// plus the passphrase needed to decrypt at startup.
fn apply_bytecode_encryptor(current: &Path) -> Result<PathBuf, ProtectError> {
    let source = std::fs::read_to_string(current)?;

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut passphrase = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut passphrase);
    let passphrase_b64 = STANDARD.encode(passphrase);

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&passphrase, &salt, PBKDF2_ITERATIONS, &mut key);

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| ProtectError::Encrypt(e.to_string()))?;
    let ciphertext =
        cipher.encrypt(nonce, source.as_bytes()).map_err(|e| ProtectError::Encrypt(e.to_string()))?;

    let loader = format!(
        "__freeze_salt = '{}'\n__freeze_nonce = '{}'\n__freeze_ciphertext = '{}'\n__freeze_passphrase = '{}'\n{}",
        STANDARD.encode(salt),
        STANDARD.encode(nonce_bytes),
        STANDARD.encode(&ciphertext),
        passphrase_b64,
        BYTECODE_LOADER_TEMPLATE,
    );

    let out_path = current.with_extension("encrypted.py");
    std::fs::write(&out_path, loader)?;
    Ok(out_path)
}

/// Decrypts the embedded ciphertext at startup and executes it. The PBKDF2
/// iteration count and digest (SHA-256) must match [`PBKDF2_ITERATIONS`] above.
const BYTECODE_LOADER_TEMPLATE: &str = r#"
import base64 as __freeze_base64
import hashlib as __freeze_hashlib

def __freeze_decrypt_and_run():
    from cryptography.hazmat.primitives.ciphers.aead import AESGCM
    salt = __freeze_base64.b64decode(__freeze_salt)
    nonce = __freeze_base64.b64decode(__freeze_nonce)
    ciphertext = __freeze_base64.b64decode(__freeze_ciphertext)
    passphrase = __freeze_base64.b64decode(__freeze_passphrase)
    key = __freeze_hashlib.pbkdf2_hmac("sha256", passphrase, salt, 10000, dklen=32)
    plaintext = AESGCM(key).decrypt(nonce, ciphertext, None)
    exec(compile(plaintext, "<encrypted>", "exec"), {"__name__": "__main__"})

__freeze_decrypt_and_run()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytecode_encryptor_round_trips_through_aes_gcm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.py");
        std::fs::write(&path, "print('hi')\n").unwrap();

        let out_path = apply_bytecode_encryptor(&path).unwrap();
        let loader = std::fs::read_to_string(out_path).unwrap();
        assert!(loader.contains("__freeze_ciphertext"));
        assert!(loader.contains("AESGCM"));
    }

    #[tokio::test]
    async fn run_protect_with_no_methods_succeeds_trivially() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.py");
        std::fs::write(&path, "print('hi')\n").unwrap();

        let job = Job::builder(&path).protection_level(crate::job::ProtectionLevel::None).build().unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let outcome = run_protect(&[], &job, &path, &cancel).await;
        assert!(outcome.success);
        assert!(outcome.protected_files.is_empty());
    }
}
