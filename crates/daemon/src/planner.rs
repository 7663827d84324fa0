//! Compression planner
//!
//! Turns a normalized request plus probed source metadata into a concrete
//! [`CompressionPlan`]: bitrate, resolution scale, frame rate, pass count and
//! kept segments. Planning is a pure function: no I/O, no hidden state, so
//! identical inputs always produce identical plans.

use crate::probe::{ProbeError, SourceMetadata};
use crate::request::{Codec, EncodeMode, FpsChoice, NormalizedRequest, Segment};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Share of the requested size spent on the payload; the rest absorbs
/// container and segment overhead.
pub const SIZE_SAFETY_FACTOR: f64 = 0.90;

/// Share of the codec's nominal audio bitrate budgeted for audio.
pub const AUDIO_BUDGET_FACTOR: f64 = 0.90;

/// Video bitrate floor in kbps.
pub const MIN_VIDEO_BITRATE_KBPS: u32 = 80;

pub const MIN_SCALE_PERCENT: u32 = 25;
pub const MAX_SCALE_PERCENT: u32 = 100;

/// Frame rate ceiling for automatic selection.
pub const MAX_AUTO_FPS: u32 = 30;

/// Container overhead reserved per kept segment beyond the first.
const RESERVE_KB_PER_EXTRA_SEGMENT: f64 = 24.0;

/// Container index overhead reserved per minute of output.
const RESERVE_KB_PER_MINUTE: f64 = 16.0;

/// The reserve never eats more than this share of the effective size.
const MAX_RESERVE_SHARE: f64 = 0.25;

/// Error type for planning operations
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("unknown codec '{0}' (expected h264, h265/hevc or av1)")]
    UnknownCodec(String),

    #[error("target size must be a positive number of MB, got {0}")]
    InvalidTargetSize(f64),

    #[error("source duration must be positive, got {0}s")]
    InvalidDuration(f64),

    #[error("source dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("segment [{start}, {end}] is invalid: end must be greater than start and start non-negative")]
    InvalidSegment { start: f64, end: f64 },

    #[error("no selected segment overlaps the source")]
    EmptySelection,

    /// The planner cannot proceed without source dimensions and duration.
    #[error("could not read source metadata: {0}")]
    Probe(#[from] ProbeError),
}

/// Per-codec facts the planner needs, supplied by the codec strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecPlanningContext {
    pub codec: Codec,
    pub extension: &'static str,
    /// Nominal audio bitrate of the codec's audio track.
    pub audio_bitrate_kbps: u32,
    /// Bits per pixel per frame below which the planner shrinks resolution.
    pub target_bpp: f64,
    /// Whether the resolved encoder can run a two-pass encode.
    pub supports_pass_log: bool,
}

/// Fully resolved encoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionPlan {
    pub codec: Codec,
    pub mode: EncodeMode,
    /// Stream copy, no re-encode.
    pub skip_compression: bool,
    /// Run the filter chain (denoise, scale, deband, sharpen, fps).
    pub apply_filters: bool,
    pub video_bitrate_kbps: u32,
    /// Zero when the output carries no audio.
    pub audio_bitrate_kbps: u32,
    pub scale_percent: u32,
    pub output_width: u32,
    pub output_height: u32,
    /// Output frame rate. Equals the source rate, rounded, when the source
    /// timing is kept.
    pub fps: u32,
    /// Whether the encode resamples to `fps`. False keeps the source timing
    /// untouched, including fractional NTSC rates.
    #[serde(default)]
    pub resample_fps: bool,
    pub passes: u8,
    /// Kept ranges; empty encodes the whole source.
    pub segments: Vec<Segment>,
    pub kept_duration_secs: f64,
    /// Size the plan was budgeted for, if any.
    pub target_size_mb: Option<f64>,
    pub extension: String,
}

impl CompressionPlan {
    pub fn includes_audio(&self) -> bool {
        self.audio_bitrate_kbps > 0
    }
}

/// Largest size worth compressing to: the source itself. Unknown (None) when
/// the probe could not report a file size.
pub fn effective_max_size_mb(source_size_bytes: u64) -> Option<f64> {
    if source_size_bytes == 0 {
        None
    } else {
        Some(source_size_bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Container overhead estimate in KB for the given output shape.
pub fn reserve_kb(kept_segments: usize, kept_duration_secs: f64) -> f64 {
    let extra_segments = kept_segments.saturating_sub(1) as f64;
    extra_segments * RESERVE_KB_PER_EXTRA_SEGMENT
        + RESERVE_KB_PER_MINUTE * (kept_duration_secs / 60.0)
}

/// Total bitrate (audio + video, kbps) that fits `target_mb` over the kept duration.
pub fn total_bitrate_kbps(target_mb: f64, kept_segments: usize, kept_duration_secs: f64) -> f64 {
    let effective_kb = target_mb * SIZE_SAFETY_FACTOR * 1024.0;
    let reserve = reserve_kb(kept_segments, kept_duration_secs).min(effective_kb * MAX_RESERVE_SHARE);
    (effective_kb - reserve) * 8.0 / kept_duration_secs
}

/// Pick a frame rate from the available video bitrate, capped by the source.
pub fn auto_fps(video_bitrate_kbps: u32, source_fps_cap: u32) -> u32 {
    let headroom_fps = if video_bitrate_kbps >= 300 {
        30
    } else if video_bitrate_kbps >= 150 {
        24
    } else {
        15
    };
    headroom_fps.min(MAX_AUTO_FPS).min(source_fps_cap).max(1)
}

/// Shrink resolution until the bitrate reaches the codec's bits-per-pixel target.
///
/// No fixed-resolution floor beyond the 25% scale bound: very small budgets
/// legitimately go below common minimum resolutions.
pub fn auto_scale_percent(video_bitrate_kbps: u32, fps: u32, source_pixels: u64, target_bpp: f64) -> u32 {
    if source_pixels == 0 || fps == 0 {
        return MAX_SCALE_PERCENT;
    }
    let bits_per_sec = video_bitrate_kbps as f64 * 1000.0;
    let implied_bpp = bits_per_sec / (source_pixels as f64 * fps as f64);
    if implied_bpp >= target_bpp {
        return MAX_SCALE_PERCENT;
    }

    let max_pixels = bits_per_sec / (target_bpp * fps as f64);
    let scale = (max_pixels / source_pixels as f64).sqrt();
    let percent = ((scale * 100.0 / 5.0).floor() as u32) * 5;
    percent.clamp(MIN_SCALE_PERCENT, MAX_SCALE_PERCENT)
}

/// Scale a dimension and round down to an even pixel count (minimum 2).
pub fn scaled_even_dimension(dimension: u32, scale_percent: u32) -> u32 {
    let scaled = (dimension as u64 * scale_percent as u64 / 100) as u32;
    (scaled & !1).max(2)
}

/// Tolerance when comparing a whole-number rate against a probed source rate.
const FPS_EPSILON: f64 = 0.05;

/// Probed source frame rate, when usable.
fn probed_fps(source: &SourceMetadata) -> Option<f64> {
    source
        .frame_rate
        .filter(|fps| fps.is_finite() && *fps >= 1.0)
}

/// Whole-number rate describing the source: rounded, or the auto ceiling
/// when unknown.
fn nominal_fps(source_fps: Option<f64>) -> u32 {
    source_fps.map_or(MAX_AUTO_FPS, |fps| (fps.round() as u32).max(1))
}

/// Settle a chosen frame rate against the source.
///
/// Returns the output rate and whether the encode has to resample. A choice
/// at or above the source rate keeps the source timing, so 23.976 and 29.97
/// sources are never pulled down to 23 or 29. With an unknown source rate the
/// choice is applied, capped at the auto ceiling.
pub fn resolve_fps(chosen: u32, source_fps: Option<f64>) -> (u32, bool) {
    match source_fps {
        Some(source) if chosen as f64 + FPS_EPSILON >= source => (nominal_fps(Some(source)), false),
        Some(_) => (chosen.max(1), true),
        None => (chosen.min(MAX_AUTO_FPS).max(1), true),
    }
}

/// Build the plan for a normalized request.
pub fn plan(
    request: &NormalizedRequest,
    ctx: &CodecPlanningContext,
    source: &SourceMetadata,
) -> Result<CompressionPlan, PlanningError> {
    if source.width == 0 || source.height == 0 {
        return Err(PlanningError::InvalidDimensions {
            width: source.width,
            height: source.height,
        });
    }

    let kept_duration_secs = request.kept_duration_secs();
    if !kept_duration_secs.is_finite() || kept_duration_secs <= 0.0 {
        return Err(PlanningError::InvalidDuration(kept_duration_secs));
    }

    let source_fps = probed_fps(source);
    let source_nominal_fps = nominal_fps(source_fps);
    let source_pixels = source.width as u64 * source.height as u64;
    let audio_kbps = if source.has_audio && !request.mute_audio {
        ctx.audio_bitrate_kbps
    } else {
        0
    };

    let max_allowed_mb = effective_max_size_mb(source.size_bytes);
    let target_reaches_max = match (request.target_size_mb, max_allowed_mb) {
        (Some(target), Some(max)) => target >= max,
        _ => false,
    };
    let wants_skip = !request.mute_audio
        && (target_reaches_max || (request.skip_compression && request.target_size_mb.is_none()));

    // Stream copy: only expressible when at most one range is kept.
    if wants_skip && request.segments.len() <= 1 {
        let average_kbps = if source.size_bytes > 0 {
            (source.size_bytes as f64 * 8.0 / 1000.0 / request.source_duration_secs) as u32
        } else {
            0
        };
        return Ok(CompressionPlan {
            codec: request.codec,
            mode: request.mode,
            skip_compression: true,
            apply_filters: false,
            video_bitrate_kbps: average_kbps.saturating_sub(audio_kbps).max(MIN_VIDEO_BITRATE_KBPS),
            audio_bitrate_kbps: audio_kbps,
            scale_percent: MAX_SCALE_PERCENT,
            output_width: source.width,
            output_height: source.height,
            fps: source_nominal_fps,
            resample_fps: false,
            passes: 1,
            segments: request.segments.clone(),
            kept_duration_secs,
            target_size_mb: request.target_size_mb,
            extension: ctx.extension.to_string(),
        });
    }

    // A skip that cannot be honored re-encodes at the source size, unfiltered.
    let (budget_mb, apply_filters) = if wants_skip {
        (max_allowed_mb, false)
    } else {
        (request.target_size_mb, true)
    };

    let chosen_fps = |auto: u32| match request.fps {
        FpsChoice::Fixed(fps) => resolve_fps(fps, source_fps),
        FpsChoice::Auto => resolve_fps(auto, source_fps),
    };
    let budget_video_kbps = |mb: f64| {
        let total = total_bitrate_kbps(mb, request.kept_segment_count(), kept_duration_secs);
        let audio_budget = audio_kbps as f64 * AUDIO_BUDGET_FACTOR;
        ((total - audio_budget).floor().max(0.0) as u32).max(MIN_VIDEO_BITRATE_KBPS)
    };
    // No size constraint: spend the codec's bpp target at the chosen shape.
    let bpp_video_kbps = |scale: u32, fps: u32| {
        let pixels = scaled_even_dimension(source.width, scale) as f64
            * scaled_even_dimension(source.height, scale) as f64;
        ((ctx.target_bpp * pixels * fps as f64 / 1000.0).floor() as u32).max(MIN_VIDEO_BITRATE_KBPS)
    };

    let (video_bitrate_kbps, scale_percent, fps, resample_fps) = match (budget_mb, apply_filters) {
        (Some(mb), false) => (budget_video_kbps(mb), MAX_SCALE_PERCENT, source_nominal_fps, false),
        (None, false) => (
            bpp_video_kbps(MAX_SCALE_PERCENT, source_nominal_fps),
            MAX_SCALE_PERCENT,
            source_nominal_fps,
            false,
        ),
        (Some(mb), true) => {
            let video = budget_video_kbps(mb);
            let (fps, resample) = chosen_fps(auto_fps(video, MAX_AUTO_FPS));
            let scale = request
                .scale_percent
                .unwrap_or_else(|| auto_scale_percent(video, fps, source_pixels, ctx.target_bpp));
            (video, scale, fps, resample)
        }
        (None, true) => {
            let (fps, resample) = chosen_fps(MAX_AUTO_FPS);
            let scale = request.scale_percent.unwrap_or(MAX_SCALE_PERCENT);
            (bpp_video_kbps(scale, fps), scale, fps, resample)
        }
    };

    let passes = if ctx.supports_pass_log { 2 } else { 1 };

    Ok(CompressionPlan {
        codec: request.codec,
        mode: request.mode,
        skip_compression: false,
        apply_filters,
        video_bitrate_kbps,
        audio_bitrate_kbps: audio_kbps,
        scale_percent,
        output_width: scaled_even_dimension(source.width, scale_percent),
        output_height: scaled_even_dimension(source.height, scale_percent),
        fps,
        resample_fps,
        passes,
        segments: request.segments.clone(),
        kept_duration_secs,
        target_size_mb: budget_mb,
        extension: ctx.extension.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{normalize, CompressionRequest};
    use proptest::prelude::*;

    fn h264_ctx() -> CodecPlanningContext {
        CodecPlanningContext {
            codec: Codec::H264,
            extension: "mp4",
            audio_bitrate_kbps: 128,
            target_bpp: 0.095,
            supports_pass_log: true,
        }
    }

    fn source_1080p(duration_secs: f64, size_bytes: u64) -> SourceMetadata {
        SourceMetadata {
            width: 1920,
            height: 1080,
            duration_secs,
            has_audio: true,
            frame_rate: Some(29.97),
            size_bytes,
            video_codec: Some("h264".to_string()),
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_eight_mb_two_minutes_1080p() {
        let request = CompressionRequest::new("h264").with_target_size_mb(8.0);
        let source = source_1080p(120.0, GIB);
        let normalized = normalize(&request, source.duration_secs).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        let analytic = 8.0 * 0.9 * 8192.0 / 120.0 - 0.9 * 128.0;
        let diff = (plan.video_bitrate_kbps as f64 - analytic).abs();
        assert!(diff / analytic < 0.02, "bitrate {} vs {}", plan.video_bitrate_kbps, analytic);

        // sqrt(max_pixels / pixels) at 30 fps and 0.095 bpp
        let max_pixels = plan.video_bitrate_kbps as f64 * 1000.0 / (0.095 * 30.0);
        let expected = ((max_pixels / (1920.0 * 1080.0)).sqrt() * 100.0).clamp(25.0, 100.0);
        assert!((plan.scale_percent as f64 - expected).abs() <= 5.0);
        assert!(plan.scale_percent < 50);

        assert!(!plan.skip_compression);
        assert!(plan.apply_filters);
        // 29.97 source timing kept, reported as its nominal rate.
        assert_eq!(plan.fps, 30);
        assert!(!plan.resample_fps);
        assert_eq!(plan.passes, 2);
        assert_eq!(plan.audio_bitrate_kbps, 128);
        assert_eq!(plan.output_width % 2, 0);
        assert_eq!(plan.output_height % 2, 0);
    }

    #[test]
    fn test_target_above_source_size_skips() {
        let request = CompressionRequest::new("h264").with_target_size_mb(50.0);
        let source = source_1080p(60.0, 20 * 1024 * 1024);
        let normalized = normalize(&request, 60.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert!(plan.skip_compression);
        assert!(!plan.apply_filters);
        assert_eq!(plan.passes, 1);
        assert_eq!(plan.scale_percent, 100);
        assert_eq!((plan.output_width, plan.output_height), (1920, 1080));
    }

    #[test]
    fn test_skip_flag_without_target_skips() {
        let mut request = CompressionRequest::new("h265");
        request.skip_compression = true;
        let source = source_1080p(60.0, 0);
        let normalized = normalize(&request, 60.0).unwrap();
        assert!(plan(&normalized, &h264_ctx(), &source).unwrap().skip_compression);
    }

    #[test]
    fn test_mute_prevents_skip() {
        let mut request = CompressionRequest::new("h264").with_target_size_mb(50.0);
        request.mute_audio = true;
        request.skip_compression = true;
        let source = source_1080p(60.0, 20 * 1024 * 1024);
        let normalized = normalize(&request, 60.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert!(!plan.skip_compression);
        assert_eq!(plan.audio_bitrate_kbps, 0);
        assert!(!plan.includes_audio());
    }

    #[test]
    fn test_unknown_source_size_never_auto_skips() {
        let request = CompressionRequest::new("h264").with_target_size_mb(5000.0);
        let source = source_1080p(60.0, 0);
        let normalized = normalize(&request, 60.0).unwrap();
        assert!(!plan(&normalized, &h264_ctx(), &source).unwrap().skip_compression);
    }

    #[test]
    fn test_multi_segment_skip_reencodes_unfiltered() {
        let mut request = CompressionRequest::new("h264").with_segments(vec![
            Segment::new(0.0, 10.0),
            Segment::new(20.0, 30.0),
        ]);
        request.skip_compression = true;
        let source = source_1080p(60.0, 30 * 1024 * 1024);
        let normalized = normalize(&request, 60.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert!(!plan.skip_compression);
        assert!(!plan.apply_filters);
        assert_eq!(plan.scale_percent, 100);
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.kept_duration_secs, 20.0);
        assert_eq!(plan.target_size_mb, Some(30.0));
    }

    #[test]
    fn test_film_rate_source_keeps_its_timing() {
        let request = CompressionRequest::new("h264").with_target_size_mb(40.0);
        let source = SourceMetadata {
            frame_rate: Some(23.976),
            ..source_1080p(120.0, GIB)
        };
        let normalized = normalize(&request, 120.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert_eq!(plan.fps, 24);
        assert!(!plan.resample_fps);
    }

    #[test]
    fn test_fps_resolution_against_source() {
        assert_eq!(resolve_fps(30, Some(29.97)), (30, false));
        assert_eq!(resolve_fps(24, Some(23.976)), (24, false));
        assert_eq!(resolve_fps(60, Some(25.0)), (25, false));
        assert_eq!(resolve_fps(24, Some(25.0)), (24, true));
        assert_eq!(resolve_fps(23, Some(23.976)), (23, true));
        assert_eq!(resolve_fps(30, Some(59.94)), (30, true));
        assert_eq!(resolve_fps(60, None), (MAX_AUTO_FPS, true));
        assert_eq!(resolve_fps(0, None), (1, true));
    }

    #[test]
    fn test_multi_segment_skip_with_unknown_size_stays_unfiltered() {
        let mut request = CompressionRequest::new("h264").with_segments(vec![
            Segment::new(0.0, 10.0),
            Segment::new(20.0, 30.0),
        ]);
        request.skip_compression = true;
        request.scale_percent = Some(50);
        request.target_fps = Some(12);
        let source = source_1080p(60.0, 0);
        let normalized = normalize(&request, 60.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert!(!plan.skip_compression);
        assert!(!plan.apply_filters);
        assert_eq!(plan.scale_percent, 100);
        assert_eq!((plan.output_width, plan.output_height), (1920, 1080));
        assert_eq!(plan.fps, 30);
        assert!(!plan.resample_fps);
        assert_eq!(plan.target_size_mb, None);
        let expected = (0.095 * 1920.0 * 1080.0 * 30.0 / 1000.0) as u32;
        assert_eq!(plan.video_bitrate_kbps, expected);
    }

    #[test]
    fn test_no_target_uses_bpp_budget() {
        let request = CompressionRequest::new("h264");
        let source = source_1080p(60.0, GIB);
        let normalized = normalize(&request, 60.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

        assert_eq!(plan.scale_percent, 100);
        assert_eq!(plan.fps, 30);
        assert!(!plan.resample_fps);
        let expected = (0.095 * 1920.0 * 1080.0 * 30.0 / 1000.0) as u32;
        assert_eq!(plan.video_bitrate_kbps, expected);
    }

    #[test]
    fn test_hardware_context_plans_single_pass() {
        let ctx = CodecPlanningContext {
            supports_pass_log: false,
            ..h264_ctx()
        };
        let request = CompressionRequest::new("h264").with_target_size_mb(8.0);
        let source = source_1080p(120.0, GIB);
        let normalized = normalize(&request, 120.0).unwrap();
        assert_eq!(plan(&normalized, &ctx, &source).unwrap().passes, 1);
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let request = CompressionRequest::new("h264").with_target_size_mb(8.0);
        let mut source = source_1080p(120.0, GIB);
        source.width = 0;
        let normalized = normalize(&request, 120.0).unwrap();
        assert!(matches!(
            plan(&normalized, &h264_ctx(), &source),
            Err(PlanningError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn test_explicit_scale_and_fps_honored() {
        let mut request = CompressionRequest::new("h264").with_target_size_mb(8.0);
        request.scale_percent = Some(80);
        request.target_fps = Some(12);
        let source = source_1080p(120.0, GIB);
        let normalized = normalize(&request, 120.0).unwrap();
        let plan = plan(&normalized, &h264_ctx(), &source).unwrap();
        assert_eq!(plan.scale_percent, 80);
        assert_eq!(plan.fps, 12);
        assert!(plan.resample_fps);
        assert_eq!((plan.output_width, plan.output_height), (1536, 864));
    }

    #[test]
    fn test_hevc_keeps_more_resolution_than_h264() {
        let request = CompressionRequest::new("h264").with_target_size_mb(60.0);
        let source = source_1080p(120.0, GIB);
        let normalized = normalize(&request, 120.0).unwrap();
        let avc = plan(&normalized, &h264_ctx(), &source).unwrap();
        let hevc_ctx = CodecPlanningContext {
            codec: Codec::H265,
            target_bpp: 0.065,
            ..h264_ctx()
        };
        let hevc = plan(&normalized, &hevc_ctx, &source).unwrap();
        assert!(hevc.scale_percent >= avc.scale_percent);
    }

    #[test]
    fn test_auto_fps_tiers() {
        assert_eq!(auto_fps(5000, 60), 30);
        assert_eq!(auto_fps(300, 60), 30);
        assert_eq!(auto_fps(200, 60), 24);
        assert_eq!(auto_fps(80, 60), 15);
        assert_eq!(auto_fps(5000, 10), 10);
        assert_eq!(auto_fps(5000, 0), 1);
    }

    // Planner invariants over arbitrary requests and sources.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_bitrate_floor_and_scale_grid(
            target_mb in 0.01f64..500.0,
            duration in 1.0f64..7200.0,
            width in 16u32..7680,
            height in 16u32..4320,
            mute in proptest::bool::ANY,
            quality in proptest::bool::ANY,
        ) {
            let mut request = CompressionRequest::new("h264").with_target_size_mb(target_mb);
            request.mute_audio = mute;
            request.quality_mode = quality;
            let source = SourceMetadata {
                width,
                height,
                duration_secs: duration,
                has_audio: true,
                frame_rate: Some(30.0),
                size_bytes: 0,
                video_codec: None,
            };
            let normalized = normalize(&request, duration).unwrap();
            let plan = plan(&normalized, &h264_ctx(), &source).unwrap();

            prop_assert!(plan.video_bitrate_kbps >= MIN_VIDEO_BITRATE_KBPS);
            prop_assert_eq!(plan.scale_percent % 5, 0);
            prop_assert!((25..=100).contains(&plan.scale_percent));
            prop_assert!(plan.fps >= 1 && plan.fps <= 30);
            prop_assert!(plan.output_width % 2 == 0 && plan.output_height % 2 == 0);
            if mute {
                prop_assert_eq!(plan.audio_bitrate_kbps, 0);
            }
            // Budget holds unless the floor had to kick in.
            if plan.video_bitrate_kbps > MIN_VIDEO_BITRATE_KBPS {
                let total = total_bitrate_kbps(target_mb, 1, duration);
                let audio = plan.audio_bitrate_kbps as f64 * AUDIO_BUDGET_FACTOR;
                prop_assert!(plan.video_bitrate_kbps as f64 + audio <= total + 1.0);
            }
        }

        #[test]
        fn prop_target_at_or_above_source_skips(
            source_mb in 1u64..2000,
            extra_mb in 0.0f64..1000.0,
            duration in 1.0f64..3600.0,
        ) {
            let size_bytes = source_mb * 1024 * 1024;
            let request = CompressionRequest::new("h264")
                .with_target_size_mb(source_mb as f64 + extra_mb);
            let source = SourceMetadata {
                width: 1280,
                height: 720,
                duration_secs: duration,
                has_audio: true,
                frame_rate: None,
                size_bytes,
                video_codec: None,
            };
            let normalized = normalize(&request, duration).unwrap();
            prop_assert!(plan(&normalized, &h264_ctx(), &source).unwrap().skip_compression);
        }

        #[test]
        fn prop_planning_is_deterministic(
            target_mb in 0.5f64..200.0,
            duration in 1.0f64..3600.0,
            width in 64u32..3840,
            height in 64u32..2160,
        ) {
            let request = CompressionRequest::new("hevc").with_target_size_mb(target_mb);
            let source = SourceMetadata {
                width,
                height,
                duration_secs: duration,
                has_audio: false,
                frame_rate: Some(60.0),
                size_bytes: 0,
                video_codec: None,
            };
            let normalized = normalize(&request, duration).unwrap();
            let first = plan(&normalized, &h264_ctx(), &source).unwrap();
            let second = plan(&normalized, &h264_ctx(), &source).unwrap();
            prop_assert_eq!(
                serde_json::to_vec(&first).unwrap(),
                serde_json::to_vec(&second).unwrap()
            );
        }
    }
}
