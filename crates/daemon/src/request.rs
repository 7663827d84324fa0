//! Compression requests and their normalization.
//!
//! A [`CompressionRequest`] is what a caller asks for: loosely typed, with
//! optional fields. [`normalize`] resolves it against the probed source into
//! a [`NormalizedRequest`] with a validated codec, a resolved mode and a
//! sorted, merged, clamped list of kept segments.

use crate::planner::PlanningError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound for an explicitly requested frame rate.
pub const MAX_REQUESTED_FPS: u32 = 60;

/// Video codecs the engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
    Av1,
}

impl Codec {
    pub const ALL: [Codec; 3] = [Codec::H264, Codec::H265, Codec::Av1];

    /// Canonical lowercase key.
    pub fn key(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Av1 => "av1",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Codec {
    type Err = PlanningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "h264" | "avc" | "x264" => Ok(Codec::H264),
            "h265" | "hevc" | "x265" => Ok(Codec::H265),
            "av1" => Ok(Codec::Av1),
            other => Err(PlanningError::UnknownCodec(other.to_string())),
        }
    }
}

/// Speed/quality trade-off selecting the tuning row in the encoder catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncodeMode {
    #[default]
    Fast,
    Quality,
}

impl fmt::Display for EncodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeMode::Fast => write!(f, "fast"),
            EncodeMode::Quality => write!(f, "quality"),
        }
    }
}

/// A kept time range of the source, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl Segment {
    pub fn new(start_secs: f64, end_secs: f64) -> Self {
        Self {
            start_secs,
            end_secs,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.end_secs - self.start_secs
    }
}

impl FromStr for Segment {
    type Err = String;

    /// Parses `START-END` in seconds, e.g. `12.5-40`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got '{}'", s))?;
        let start: f64 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid segment start '{}'", start))?;
        let end: f64 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid segment end '{}'", end))?;
        Ok(Segment::new(start, end))
    }
}

/// What the caller asked for. Immutable once submitted; a retry reuses it as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionRequest {
    /// Codec selector, e.g. "h264" or "HEVC".
    pub codec: String,
    #[serde(default)]
    pub target_size_mb: Option<f64>,
    #[serde(default)]
    pub scale_percent: Option<u32>,
    #[serde(default)]
    pub target_fps: Option<u32>,
    /// Ranges to keep; empty keeps the whole source.
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub mute_audio: bool,
    #[serde(default)]
    pub skip_compression: bool,
    #[serde(default)]
    pub quality_mode: bool,
    /// Used when the probe cannot report a duration.
    #[serde(default)]
    pub duration_hint_secs: Option<f64>,
}

impl CompressionRequest {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            codec: codec.into(),
            target_size_mb: None,
            scale_percent: None,
            target_fps: None,
            segments: Vec::new(),
            mute_audio: false,
            skip_compression: false,
            quality_mode: false,
            duration_hint_secs: None,
        }
    }

    pub fn with_target_size_mb(mut self, mb: f64) -> Self {
        self.target_size_mb = Some(mb);
        self
    }

    pub fn with_segments(mut self, segments: Vec<Segment>) -> Self {
        self.segments = segments;
        self
    }
}

/// Frame rate decision carried from normalization into planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "fps")]
pub enum FpsChoice {
    /// Planner picks 1..=30 from the bitrate headroom.
    Auto,
    Fixed(u32),
}

/// A request with every default resolved against the probed source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub codec: Codec,
    pub mode: EncodeMode,
    pub target_size_mb: Option<f64>,
    /// Explicit scale, already on the 5% grid within [25, 100].
    pub scale_percent: Option<u32>,
    pub fps: FpsChoice,
    /// Sorted, merged, clamped kept ranges. Empty means the whole source.
    pub segments: Vec<Segment>,
    pub source_duration_secs: f64,
    pub mute_audio: bool,
    pub skip_compression: bool,
}

impl NormalizedRequest {
    /// Seconds of media that end up in the output.
    pub fn kept_duration_secs(&self) -> f64 {
        if self.segments.is_empty() {
            self.source_duration_secs
        } else {
            self.segments.iter().map(Segment::duration_secs).sum()
        }
    }

    /// Number of kept ranges, counting an untrimmed source as one.
    pub fn kept_segment_count(&self) -> usize {
        self.segments.len().max(1)
    }
}

/// Round a scale percent down to the 5% grid and clamp it to [25, 100].
pub fn snap_scale_percent(percent: u32) -> u32 {
    ((percent / 5) * 5).clamp(25, 100)
}

/// Resolve a request against the source duration reported by the probe.
///
/// `probed_duration_secs` wins when positive; otherwise the request's
/// duration hint is used.
pub fn normalize(
    request: &CompressionRequest,
    probed_duration_secs: f64,
) -> Result<NormalizedRequest, PlanningError> {
    let codec: Codec = request.codec.parse()?;

    let source_duration_secs = if probed_duration_secs.is_finite() && probed_duration_secs > 0.0 {
        probed_duration_secs
    } else {
        match request.duration_hint_secs {
            Some(hint) if hint.is_finite() && hint > 0.0 => hint,
            _ => return Err(PlanningError::InvalidDuration(probed_duration_secs)),
        }
    };

    if let Some(mb) = request.target_size_mb {
        if !mb.is_finite() || mb <= 0.0 {
            return Err(PlanningError::InvalidTargetSize(mb));
        }
    }

    let fps = match request.target_fps {
        Some(fps) => FpsChoice::Fixed(fps.clamp(1, MAX_REQUESTED_FPS)),
        None => FpsChoice::Auto,
    };

    let segments = normalize_segments(&request.segments, source_duration_secs)?;

    Ok(NormalizedRequest {
        codec,
        mode: if request.quality_mode {
            EncodeMode::Quality
        } else {
            EncodeMode::Fast
        },
        target_size_mb: request.target_size_mb,
        scale_percent: request.scale_percent.map(snap_scale_percent),
        fps,
        segments,
        source_duration_secs,
        mute_audio: request.mute_audio,
        skip_compression: request.skip_compression,
    })
}

/// Validate, clamp, sort and merge kept segments.
///
/// Overlapping or touching ranges collapse into one. A single range that
/// covers the whole source is returned as "no trim" (empty).
pub fn normalize_segments(
    segments: &[Segment],
    duration_secs: f64,
) -> Result<Vec<Segment>, PlanningError> {
    if segments.is_empty() {
        return Ok(Vec::new());
    }

    let mut clamped = Vec::with_capacity(segments.len());
    for seg in segments {
        if !seg.start_secs.is_finite()
            || !seg.end_secs.is_finite()
            || seg.start_secs < 0.0
            || seg.end_secs <= seg.start_secs
        {
            return Err(PlanningError::InvalidSegment {
                start: seg.start_secs,
                end: seg.end_secs,
            });
        }

        let start = seg.start_secs.min(duration_secs);
        let end = seg.end_secs.min(duration_secs);
        if end > start {
            clamped.push(Segment::new(start, end));
        }
    }

    if clamped.is_empty() {
        return Err(PlanningError::EmptySelection);
    }

    clamped.sort_by(|a, b| a.start_secs.total_cmp(&b.start_secs));

    let mut merged: Vec<Segment> = Vec::with_capacity(clamped.len());
    for seg in clamped {
        match merged.last_mut() {
            Some(last) if seg.start_secs <= last.end_secs => {
                last.end_secs = last.end_secs.max(seg.end_secs);
            }
            _ => merged.push(seg),
        }
    }

    if merged.len() == 1 && merged[0].start_secs <= 0.0 && merged[0].end_secs >= duration_secs {
        return Ok(Vec::new());
    }

    Ok(merged)
}
