//! Audio/video container handling delegated to an external toolkit.

use crate::defaults;
use crate::error::{DubError, Result};
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Classify `path` by extension; `None` for unsupported formats.
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if defaults::SUPPORTED_AUDIO_FORMATS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if defaults::SUPPORTED_VIDEO_FORMATS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Duration of a WAV file in seconds, `None` for anything hound cannot read.
pub fn probe_wav_duration(path: &Path) -> Option<f64> {
    let reader = hound::WavReader::open(path).ok()?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return None;
    }
    Some(f64::from(reader.duration()) / f64::from(spec.sample_rate))
}

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    fn name(&self) -> &str;

    /// Pull the audio track out of `video` into `work_dir`.
    async fn extract_audio(&self, video: &Path, work_dir: &Path) -> Result<PathBuf>;

    /// Produce the final artifact at `output` from the dubbed audio, muxing
    /// it with `source` when the source is a video. Returns the written path.
    async fn deliver(&self, source: &Path, dubbed_audio: &Path, output: &Path) -> Result<PathBuf>;
}

/// Uses the `ffmpeg` binary on `PATH`.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    binary: PathBuf,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegToolkit {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn ffprobe(&self) -> PathBuf {
        self.binary.with_file_name("ffprobe")
    }

    /// Length of `path` in seconds. WAV is read directly, anything else goes
    /// through `ffprobe`; `None` when neither can tell.
    async fn duration(&self, path: &Path) -> Option<f64> {
        if let Some(secs) = probe_wav_duration(path) {
            return Some(secs);
        }
        let output = Command::new(self.ffprobe())
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().parse().ok()
            }
            Ok(output) => {
                tracing::debug!(path = %path.display(), status = %output.status, "ffprobe failed");
                None
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "ffprobe unavailable");
                None
            }
        }
    }

    async fn run(&self, args: &[&OsStr]) -> Result<()> {
        tracing::debug!(binary = %self.binary.display(), ?args, "running media toolkit");
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DubError::Media {
                message: format!("failed to run {}: {}", self.binary.display(), e),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
        Err(DubError::Media {
            message: format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            ),
        })
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn extract_audio(&self, video: &Path, work_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(work_dir).await?;
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let audio = work_dir.join(format!("{}.wav", stem));
        self.run(&[
            OsStr::new("-y"),
            OsStr::new("-i"),
            video.as_os_str(),
            OsStr::new("-vn"),
            OsStr::new("-ac"),
            OsStr::new("1"),
            OsStr::new("-ar"),
            OsStr::new("16000"),
            OsStr::new("-c:a"),
            OsStr::new("pcm_s16le"),
            audio.as_os_str(),
        ])
        .await?;
        Ok(audio)
    }

    async fn deliver(&self, source: &Path, dubbed_audio: &Path, output: &Path) -> Result<PathBuf> {
        if media_kind(source) != Some(MediaKind::Video) {
            tokio::fs::copy(dubbed_audio, output).await?;
            return Ok(output.to_path_buf());
        }
        let source_secs = self.duration(source).await;
        let dubbed_secs = self.duration(dubbed_audio).await;
        let tempo = match (source_secs, dubbed_secs) {
            (Some(target), Some(current)) => tempo_factor(target, current),
            _ => None,
        };
        tracing::debug!(?source_secs, ?dubbed_secs, ?tempo, "fitting dubbed audio to video");
        let args = mux_args(source, dubbed_audio, output, source_secs, tempo);
        let args: Vec<&OsStr> = args.iter().map(OsString::as_os_str).collect();
        self.run(&args).await?;
        Ok(output.to_path_buf())
    }
}

/// Speed factor that brings `current_secs` of audio to `target_secs`,
/// clamped to the supported tempo range. `None` when no change is needed.
pub fn tempo_factor(target_secs: f64, current_secs: f64) -> Option<f64> {
    if target_secs <= 0.0 || current_secs <= 0.0 {
        return None;
    }
    let ratio = (current_secs / target_secs)
        .clamp(defaults::TEMPO_MIN_SPEED, defaults::TEMPO_MAX_SPEED);
    if (ratio - 1.0).abs() < defaults::TEMPO_TOLERANCE {
        None
    } else {
        Some(ratio)
    }
}

/// Arguments muxing `dubbed` over the video stream of `source`.
///
/// The audio is sped up or slowed by `tempo` and padded with silence to
/// the source length, so the output is never cut short by the video.
pub fn mux_args(
    source: &Path,
    dubbed: &Path,
    output: &Path,
    source_secs: Option<f64>,
    tempo: Option<f64>,
) -> Vec<OsString> {
    let mut filters = Vec::new();
    if let Some(tempo) = tempo {
        filters.push(format!("atempo={:.3}", tempo));
    }
    if let Some(secs) = source_secs {
        filters.push(format!("apad=whole_dur={:.3}", secs));
    }

    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        source.into(),
        "-i".into(),
        dubbed.into(),
        "-map".into(),
        "0:v".into(),
        "-map".into(),
        "1:a".into(),
        "-c:v".into(),
        "copy".into(),
    ];
    if !filters.is_empty() {
        args.push("-filter:a".into());
        args.push(filters.join(",").into());
    }
    args.push(output.into());
    args
}

/// No external tools: audio is used as-is and the dubbed audio becomes the
/// output. Video sources are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughToolkit;

#[async_trait]
impl MediaToolkit for PassthroughToolkit {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn extract_audio(&self, video: &Path, _work_dir: &Path) -> Result<PathBuf> {
        Err(DubError::Media {
            message: format!("cannot extract audio from {} without ffmpeg", video.display()),
        })
    }

    async fn deliver(&self, _source: &Path, dubbed_audio: &Path, output: &Path) -> Result<PathBuf> {
        tokio::fs::copy(dubbed_audio, output).await?;
        Ok(output.to_path_buf())
    }
}
