//! Source metadata probing.
//!
//! Runs ffprobe on a source file and reduces its JSON report to the handful
//! of facts planning needs: dimensions, duration, frame rate, audio presence
//! and file size.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe output was not the expected JSON.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The file has no video stream to compress.
    #[error("no video stream found")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the planner needs to know about a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub width: u32,
    pub height: u32,
    pub duration_secs: f64,
    pub has_audio: bool,
    /// Average frame rate of the first video stream, when ffprobe knows it.
    pub frame_rate: Option<f64>,
    /// Zero when unknown.
    pub size_bytes: u64,
    pub video_codec: Option<String>,
}

/// Metadata source consumed by the orchestrator.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<SourceMetadata, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Parse an ffprobe rational such as `30000/1001`. `0/0` means unknown.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Parses ffprobe JSON output into source metadata.
pub fn parse_ffprobe_output(json_str: &str) -> Result<SourceMetadata, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate));

    // Some containers only report duration on the stream.
    let duration_secs = format
        .duration
        .as_deref()
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_deref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(SourceMetadata {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        duration_secs,
        has_audio,
        frame_rate,
        size_bytes,
        video_codec: video.codec_name.clone(),
    })
}

/// Probe backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_path: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MetadataProbe for FfprobeProbe {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
    async fn probe(&self, path: &Path) -> Result<SourceMetadata, ProbeError> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut metadata = parse_ffprobe_output(&stdout)?;
        if metadata.size_bytes == 0 {
            metadata.size_bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        }
        debug!(
            path = %path.display(),
            width = metadata.width,
            height = metadata.height,
            duration_secs = metadata.duration_secs,
            "probed source"
        );
        Ok(metadata)
    }
}
