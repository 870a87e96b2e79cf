//! Compress-stage backends: UPX-like (external, in-place), LZMA-like, Brotli-like,
//! and Adaptive (entropy/repetition-driven dispatch between the two, emitting the
//! framed `PFC\x01` format described in the external-interfaces section).

use std::{
    io::Read,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use tokio::process::Command;
use tokio::time::timeout;

use crate::job::{CompressOutcome, Job};
use crate::registry::ToolDescriptor;

use super::{pick_highest, SchedulerError};

const COMPRESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Magic bytes prefixing an Adaptive-compressed artifact.
pub const ADAPTIVE_MAGIC: [u8; 4] = *b"PFC\x01";

/// Which codec a framed Adaptive payload was written with, so [`decompress_adaptive`]
/// can invert it without re-running the entropy/repetition heuristic against
/// already-compressed bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdaptiveCodec {
    Lzma = 0,
    Brotli = 1,
}

impl AdaptiveCodec {
    fn from_tag(tag: u8) -> std::io::Result<Self> {
        match tag {
            0 => Ok(Self::Lzma),
            1 => Ok(Self::Brotli),
            other => {
                Err(std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unknown adaptive codec tag {other}")))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Pe,
    Elf,
    MachO,
    Other,
}

/// Lightweight facts about the input file the scoring functions need, mirroring the
/// `_get_file_info`/`_detect_file_type` helper shared by every backend in the tool
/// this component is modeled on.
pub struct InputFileInfo {
    pub size: u64,
    pub kind: FileKind,
    pub executable_bit: bool,
    pub text_like_extension: bool,
}

impl InputFileInfo {
    pub fn inspect(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mut header = [0u8; 4];
        let mut file = std::fs::File::open(path)?;
        let read = file.read(&mut header).unwrap_or(0);
        let kind = match &header[..read] {
            b"MZ" | [b'M', b'Z', ..] => FileKind::Pe,
            [0x7f, b'E', b'L', b'F'] => FileKind::Elf,
            [0xca, 0xfe, 0xba, 0xbe] => FileKind::MachO,
            _ => FileKind::Other,
        };
        let text_like_extension = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt" | "json" | "py" | "md" | "csv" | "xml" | "html")
        );
        #[cfg(unix)]
        let executable_bit = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o111 != 0
        };
        #[cfg(not(unix))]
        let executable_bit = matches!(kind, FileKind::Pe);

        Ok(Self { size: meta.len(), kind, executable_bit, text_like_extension })
    }
}

pub trait CompressBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, job: &Job, info: &InputFileInfo) -> i32;
}

pub struct UpxBackend;
pub struct LzmaBackend;
pub struct BrotliBackend;
pub struct AdaptiveBackend;

impl CompressBackend for UpxBackend {
    fn name(&self) -> &'static str {
        "upx"
    }

    fn score(&self, _job: &Job, info: &InputFileInfo) -> i32 {
        let mut score = 50;
        if info.kind == FileKind::Pe {
            score += 40;
        }
        if cfg!(unix) && info.executable_bit {
            score += 30;
        }
        if info.size > 10 * 1024 * 1024 {
            score += 10;
        } else if info.size > 1024 * 1024 {
            score += 5;
        }
        if info.size < 100 * 1024 {
            score -= 20;
        }
        score.clamp(0, 100)
    }
}

impl CompressBackend for LzmaBackend {
    fn name(&self) -> &'static str {
        "lzma"
    }

    fn score(&self, _job: &Job, info: &InputFileInfo) -> i32 {
        let mut score = 60;
        if info.size > 1024 * 1024 {
            score += 20;
        }
        if info.executable_bit || info.kind != FileKind::Other {
            score -= 30;
        }
        score.clamp(0, 100)
    }
}

impl CompressBackend for BrotliBackend {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn score(&self, _job: &Job, info: &InputFileInfo) -> i32 {
        let mut score = 65;
        if info.text_like_extension {
            score += 25;
        }
        if info.executable_bit || info.kind != FileKind::Other {
            score -= 40;
        }
        score.clamp(0, 100)
    }
}

impl CompressBackend for AdaptiveBackend {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn score(&self, _job: &Job, info: &InputFileInfo) -> i32 {
        let mut score = 70 + 15; // base + flexibility bonus
        if info.size > 500 * 1024 {
            score += 10;
        }
        score.clamp(0, 100)
    }
}

pub fn all_backends() -> Vec<Box<dyn CompressBackend>> {
    vec![Box::new(UpxBackend), Box::new(LzmaBackend), Box::new(BrotliBackend), Box::new(AdaptiveBackend)]
}

/// Shannon entropy over byte frequency, in bits per byte (0.0..=8.0).
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Fraction of adjacent byte pairs that repeat, sampled over at most 1000 bytes, per
/// the component design's entropy/repetition heuristic.
pub fn repetition_ratio(data: &[u8]) -> f64 {
    let sample = &data[..data.len().min(1000)];
    if sample.len() < 2 {
        return 0.0;
    }
    let matches = sample.windows(2).filter(|w| w[0] == w[1]).count();
    matches as f64 / (sample.len() - 1) as f64
}

fn lzma_compress(data: &[u8], level: u8) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let options = lzma_rs::compress::Options { unpacked_size: lzma_rs::compress::UnpackedSize::WriteToHeader(Some(data.len() as u64)) };
    let _ = level;
    lzma_rs::lzma_compress_with_options(&mut std::io::Cursor::new(data), &mut out, &options)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(out)
}

#[cfg(feature = "brotli-compressor")]
fn brotli_compress(data: &[u8], level: u8) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let params = brotli::enc::BrotliEncoderParams { quality: level as i32, ..Default::default() };
    brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut out, &params)?;
    Ok(out)
}

#[cfg(not(feature = "brotli-compressor"))]
fn brotli_compress(_data: &[u8], _level: u8) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "brotli-compressor feature disabled"))
}

#[cfg(feature = "brotli-compressor")]
fn brotli_decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    brotli::BrotliDecompress(&mut std::io::Cursor::new(payload), &mut out)?;
    Ok(out)
}

#[cfg(not(feature = "brotli-compressor"))]
fn brotli_decompress(_payload: &[u8]) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "brotli-compressor feature disabled"))
}

fn lzma_decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    lzma_rs::lzma_decompress(&mut std::io::Cursor::new(payload), &mut out)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(out)
}

/// Frames a compressed payload as `PFC\x01` + little-endian original size + a
/// 1-byte [`AdaptiveCodec`] tag + payload.
fn frame_adaptive(original_size: u64, codec: AdaptiveCodec, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&ADAPTIVE_MAGIC);
    out.extend_from_slice(&(original_size as u32).to_le_bytes());
    out.push(codec as u8);
    out.extend_from_slice(payload);
    out
}

/// Inverse of [`frame_adaptive`]'s header: returns `(original_size, codec, payload)`.
pub fn unframe_adaptive(framed: &[u8]) -> Option<(u32, AdaptiveCodec, &[u8])> {
    if framed.len() < 9 || framed[..4] != ADAPTIVE_MAGIC {
        return None;
    }
    let size = u32::from_le_bytes(framed[4..8].try_into().ok()?);
    let codec = AdaptiveCodec::from_tag(framed[8]).ok()?;
    Some((size, codec, &framed[9..]))
}

/// Chooses LZMA or Brotli per the entropy/repetition heuristic and writes the
/// framed output.
fn adaptive_compress(data: &[u8], level: u8) -> std::io::Result<Vec<u8>> {
    let entropy = shannon_entropy(data);
    let repetition = repetition_ratio(data);

    let (codec, payload) = if entropy < 6.0 && repetition > 0.3 {
        (AdaptiveCodec::Lzma, lzma_compress(data, level)?)
    } else if cfg!(feature = "brotli-compressor") && data.len() < 1024 * 1024 {
        (AdaptiveCodec::Brotli, brotli_compress(data, level)?)
    } else {
        (AdaptiveCodec::Lzma, lzma_compress(data, level.min(6))?)
    };

    Ok(frame_adaptive(data.len() as u64, codec, &payload))
}

/// Inverts [`adaptive_compress`]: reads the codec tag out of the frame and dispatches
/// to the matching decompressor, so callers never need to know which branch the
/// compress side took.
pub fn decompress_adaptive(framed: &[u8]) -> std::io::Result<Vec<u8>> {
    let (_original_size, codec, payload) = unframe_adaptive(framed)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "not a valid adaptive-framed payload"))?;
    match codec {
        AdaptiveCodec::Lzma => lzma_decompress(payload),
        AdaptiveCodec::Brotli => brotli_decompress(payload),
    }
}

/// Selects the highest-scoring available backend, runs it (in-process for the three
/// builtin backends, as a subprocess for UPX), and normalizes the result.
#[tracing::instrument(skip(backends, tools, job, cancel), fields(job.artifact = %job.artifact_name))]
pub async fn run_compress(
    backends: &[Box<dyn CompressBackend>],
    tools: &[ToolDescriptor],
    job: &Job,
    artifact_path: &Path,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<CompressOutcome, SchedulerError> {
    let info = InputFileInfo::inspect(artifact_path)?;

    let available: Vec<&Box<dyn CompressBackend>> = backends
        .iter()
        .filter(|b| {
            let forced = match job.compression_method {
                crate::job::CompressionMethod::Auto | crate::job::CompressionMethod::None => None,
                crate::job::CompressionMethod::Upx => Some("upx"),
                crate::job::CompressionMethod::Lzma => Some("lzma"),
                crate::job::CompressionMethod::Brotli => Some("brotli"),
                crate::job::CompressionMethod::Adaptive => Some("adaptive"),
            };
            forced.map_or(true, |f| f == b.name())
        })
        .filter(|b| tools.iter().any(|t| t.name == b.name() && t.available))
        .collect();

    let backend = pick_highest(&available, |b| b.score(job, &info)).ok_or(SchedulerError::NoToolAvailable)?;

    tracing::debug!(tool = backend.name(), "scheduler.selected");
    let start = Instant::now();

    let result = match backend.name() {
        "upx" => run_upx(tools, job, artifact_path, cancel).await,
        name => run_inprocess(name, artifact_path, job.compression_level),
    };

    let wall_time = start.elapsed();
    let original_size = info.size;

    match result {
        Ok((compressed_size, out_path)) => Ok(CompressOutcome {
            success: true,
            original_size,
            compressed_size,
            wall_time,
            tool_name: backend.name().into(),
            artifact_path: Some(out_path),
            error: None,
        }),
        Err(e) => Ok(CompressOutcome {
            success: false,
            original_size,
            compressed_size: 0,
            wall_time,
            tool_name: backend.name().into(),
            artifact_path: None,
            error: Some(e.to_string()),
        }),
    }
}

fn run_inprocess(name: &str, artifact_path: &Path, level: u8) -> Result<(u64, PathBuf), SchedulerError> {
    let data = std::fs::read(artifact_path)?;
    let (payload, suffix) = match name {
        "lzma" => (lzma_compress(&data, level)?, "lzma"),
        "brotli" => (brotli_compress(&data, level)?, "br"),
        "adaptive" => (adaptive_compress(&data, level)?, "pfc"),
        _ => unreachable!("unknown in-process compress backend {name}"),
    };
    let out_path = artifact_path.with_extension(suffix);
    std::fs::write(&out_path, &payload)?;
    Ok((payload.len() as u64, out_path))
}

async fn run_upx(
    tools: &[ToolDescriptor],
    job: &Job,
    artifact_path: &Path,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<(u64, PathBuf), SchedulerError> {
    let tool = tools.iter().find(|t| t.name == "upx").ok_or(SchedulerError::NoToolAvailable)?;
    let level_flag = match job.compression_level {
        9 => "--ultra-brute".to_string(),
        7..=8 => "--best".to_string(),
        l => format!("-{l}"),
    };

    let mut cmd = Command::new(&tool.path);
    cmd.arg(level_flag).arg(artifact_path);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = timeout(COMPRESS_TIMEOUT, super::run_cancellable(cmd, cancel))
        .await
        .map_err(|_| SchedulerError::Timeout { tool: "upx".into(), timeout: COMPRESS_TIMEOUT })??;

    if !output.status.success() {
        return Err(SchedulerError::SubprocessFailure {
            tool: "upx".into(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let size = std::fs::metadata(artifact_path)?.len();
    Ok((size, artifact_path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_uniform_bytes_is_zero() {
        let data = vec![7u8; 1024];
        assert_eq!(shannon_entropy(&data), 0.0);
    }

    #[test]
    fn entropy_of_random_looking_bytes_is_high() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert!(shannon_entropy(&data) > 7.0);
    }

    #[test]
    fn repetition_ratio_detects_runs() {
        let data = vec![1u8; 100];
        assert_eq!(repetition_ratio(&data), 1.0);
    }

    #[test]
    fn frame_round_trips_header() {
        let framed = frame_adaptive(42, AdaptiveCodec::Lzma, b"payload");
        let (size, codec, payload) = unframe_adaptive(&framed).unwrap();
        assert_eq!(size, 42);
        assert_eq!(codec, AdaptiveCodec::Lzma);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn adaptive_round_trip_on_repetitive_data() {
        // Low entropy, high repetition: routes through the LZMA branch.
        let data = vec![9u8; 4096];
        let compressed = adaptive_compress(&data, 6).unwrap();
        let (size, codec, _) = unframe_adaptive(&compressed).unwrap();
        assert_eq!(size as usize, data.len());
        assert_eq!(codec, AdaptiveCodec::Lzma);

        let restored = decompress_adaptive(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn adaptive_round_trip_on_high_entropy_data() {
        // High entropy, low repetition: routes through the Brotli branch (when the
        // feature is enabled) rather than LZMA.
        let data: Vec<u8> = (0u32..300_000).map(|i| (i.wrapping_mul(2654435761) >> 16) as u8).collect();
        let compressed = adaptive_compress(&data, 6).unwrap();
        let (size, codec, _) = unframe_adaptive(&compressed).unwrap();
        assert_eq!(size as usize, data.len());
        if cfg!(feature = "brotli-compressor") {
            assert_eq!(codec, AdaptiveCodec::Brotli);
        } else {
            assert_eq!(codec, AdaptiveCodec::Lzma);
        }

        let restored = decompress_adaptive(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn adaptive_round_trip_on_large_low_repetition_data_uses_lzma() {
        // Not repetitive enough for the LZMA fast path and too large for the Brotli
        // branch's size cap: falls through to the reduced-level LZMA branch.
        let data: Vec<u8> = (0u32..(2 * 1024 * 1024)).map(|i| (i.wrapping_mul(2654435761) >> 16) as u8).collect();
        let compressed = adaptive_compress(&data, 9).unwrap();
        let (_, codec, _) = unframe_adaptive(&compressed).unwrap();
        assert_eq!(codec, AdaptiveCodec::Lzma);

        let restored = decompress_adaptive(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn upx_scores_higher_for_pe_executables() {
        let job = Job::builder("entry.py").build().unwrap();
        let small_other = InputFileInfo { size: 2048, kind: FileKind::Other, executable_bit: false, text_like_extension: false };
        let pe = InputFileInfo { size: 2 * 1024 * 1024, kind: FileKind::Pe, executable_bit: false, text_like_extension: false };
        assert!(UpxBackend.score(&job, &pe) > UpxBackend.score(&job, &small_other));
    }
}
