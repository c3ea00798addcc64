//! Voice sample preparation.
//!
//! Reference samples clone best as mono 22 050 Hz WAV.  This module turns
//! whatever the user recorded into that shape:
//!
//! 1. **Decode** — WAV is read with `hound`; MP3 / M4A are first decoded to a
//!    scratch WAV by an `ffmpeg` subprocess.
//! 2. **Down-mix** — channels are averaged into one.
//! 3. **Resample** — `rubato` FFT resampler to [`TARGET_SAMPLE_RATE`] when the
//!    source rate differs.
//! 4. **Write** — 16-bit PCM mono WAV, staged next to the target and renamed.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use rubato::{FftFixedIn, Resampler};
use tracing::{info, warn};

/// Sample rate voice references are converted to.
pub const TARGET_SAMPLE_RATE: u32 = 22_050;

/// Input frames per resampler block.
const RESAMPLE_CHUNK: usize = 1024;

/// Formats [`SamplePreparer::convert_directory`] converts to WAV.
const CONVERTIBLE_EXTENSIONS: &[&str] = &["mp3", "m4a"];

/// What [`SamplePreparer::prepare`] did to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    pub source_rate: u32,
    pub source_channels: u16,
    /// Frames in the written file.
    pub frames: usize,
}

impl SampleReport {
    pub fn downmixed(&self) -> bool {
        self.source_channels > 1
    }

    pub fn resampled(&self, target_rate: u32) -> bool {
        self.source_rate != target_rate
    }
}

/// Outcome of a directory conversion; per-file failures don't stop the batch.
#[derive(Debug, Default)]
pub struct ConversionSummary {
    pub converted: Vec<PathBuf>,
    /// Sources whose `.wav` counterpart already existed.
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone)]
pub struct SamplePreparer {
    ffmpeg: PathBuf,
    target_rate: u32,
}

impl Default for SamplePreparer {
    fn default() -> Self {
        Self { ffmpeg: PathBuf::from("ffmpeg"), target_rate: TARGET_SAMPLE_RATE }
    }
}

impl SamplePreparer {
    pub fn new(ffmpeg: impl Into<PathBuf>, target_rate: u32) -> Self {
        Self { ffmpeg: ffmpeg.into(), target_rate }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Convert `input` to a mono WAV at the target rate, written to `output`.
    pub fn prepare(&self, input: &Path, output: &Path) -> Result<SampleReport> {
        let is_wav = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);

        let (rate, channels, interleaved) = if is_wav {
            read_wav(input)?
        } else {
            let scratch = tempfile::Builder::new()
                .prefix("voxclone-decode-")
                .suffix(".wav")
                .tempfile()
                .context("Cannot create decode scratch file")?
                .into_temp_path();
            self.decode_with_ffmpeg(input, &scratch)?;
            read_wav(&scratch)?
        };

        let mono = downmix(&interleaved, channels);
        let samples = if rate != self.target_rate {
            resample(&mono, rate, self.target_rate)?
        } else {
            mono
        };

        write_wav(output, &samples, self.target_rate)?;
        Ok(SampleReport { source_rate: rate, source_channels: channels, frames: samples.len() })
    }

    /// Produce `<stem>.wav` for every MP3 / M4A file in `dir`.
    pub fn convert_directory(&self, dir: &Path) -> Result<ConversionSummary> {
        if !dir.is_dir() {
            bail!("Voices directory not found: {}", dir.display());
        }
        let mut sources: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Cannot read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| CONVERTIBLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        sources.sort();

        let mut summary = ConversionSummary::default();
        for source in sources {
            let target = source.with_extension("wav");
            if target.exists() {
                info!(source = %source.display(), "skipping, {} already exists", target.display());
                summary.skipped.push(source);
                continue;
            }
            match self.prepare(&source, &target) {
                Ok(report) => {
                    info!(
                        source = %source.display(),
                        target = %target.display(),
                        source_rate = report.source_rate,
                        source_channels = report.source_channels,
                        frames = report.frames,
                        "converted"
                    );
                    summary.converted.push(target);
                }
                Err(e) => {
                    warn!(source = %source.display(), "conversion failed: {e:#}");
                    summary.failed.push((source, format!("{e:#}")));
                }
            }
        }
        Ok(summary)
    }

    fn decode_with_ffmpeg(&self, input: &Path, output: &Path) -> Result<()> {
        let result = Command::new(&self.ffmpeg)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-f")
            .arg("wav")
            .arg(output)
            .output()
            .with_context(|| format!("Failed to run {}", self.ffmpeg.display()))?;
        if !result.status.success() {
            bail!(
                "ffmpeg could not decode {}: {}",
                input.display(),
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WAV I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Read a WAV file as interleaved f32 samples in [-1, 1].
fn read_wav(path: &Path) -> Result<(u32, u16, Vec<f32>)> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Cannot open WAV: {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        bail!("WAV has no channels: {}", path.display());
    }
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("WAV read error")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("WAV read error")?
        }
    };
    Ok((spec.sample_rate, spec.channels, samples))
}

/// Write mono samples as 16-bit PCM, replacing `path` only once complete.
fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".convert-")
        .suffix(".part")
        .tempfile_in(parent)
        .with_context(|| format!("Cannot stage output in {}", parent.display()))?;
    {
        let mut writer = hound::WavWriter::new(BufWriter::new(staged.as_file()), spec)
            .with_context(|| format!("Cannot create WAV: {}", path.display()))?;
        for &s in samples {
            let s16 = (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(s16).context("WAV write error")?;
        }
        writer.finalize().context("WAV finalise error")?;
    }
    staged
        .persist(path)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// DSP
// ─────────────────────────────────────────────────────────────────────────────

/// Average interleaved channels into one.
fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels as usize;
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample a mono signal, compensating for the resampler's delay so the
/// output lines up with the input and has `len * to / from` frames.
fn resample(mono: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if mono.is_empty() {
        return Ok(Vec::new());
    }
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .context("Cannot build resampler")?;
    let delay = resampler.output_delay();
    let expected = ((mono.len() as u64 * to as u64 + from as u64 / 2) / from as u64) as usize;

    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut pos = 0;
    while mono.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let block: [&[f32]; 1] = [&mono[pos..pos + n]];
        let produced = resampler.process(&block[..], None).context("Resampling failed")?;
        out.extend_from_slice(&produced[0]);
        pos += n;
    }
    if pos < mono.len() {
        let block: [&[f32]; 1] = [&mono[pos..]];
        let produced = resampler
            .process_partial(Some(&block[..]), None)
            .context("Resampling failed")?;
        out.extend_from_slice(&produced[0]);
    }
    // Flush what is still buffered inside the resampler.
    while out.len() < expected + delay {
        let produced = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .context("Resampling failed")?;
        if produced[0].is_empty() {
            break;
        }
        out.extend_from_slice(&produced[0]);
    }

    let end = (delay + expected).min(out.len());
    Ok(out[delay.min(end)..end].to_vec())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
