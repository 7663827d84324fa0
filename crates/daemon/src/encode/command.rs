//! Encoder invocation assembly
//!
//! Builds the complete ffmpeg argument list for each pass of a plan. A single
//! kept segment is trimmed by seeking at the input; several kept segments are
//! selected inside the filter graph with timestamps rewritten.

use crate::encode::catalog::CatalogError;
use crate::encode::strategy::CodecStrategy;
use crate::filters::{build_filter_chain, FilterOptions, FilterParams};
use crate::planner::CompressionPlan;
use crate::request::Segment;
use std::path::Path;

/// Flags whose values are colon-separated parameter lists.
const MERGEABLE_PARAM_FLAGS: [&str; 2] = ["-x265-params", "-svtav1-params"];

/// Everything needed to build the arguments for a job.
#[derive(Debug, Clone, Copy)]
pub struct EncodeInvocation<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub plan: &'a CompressionPlan,
    pub strategy: &'a CodecStrategy,
    /// Thread budget, applied to software encoders only.
    pub threads: Option<usize>,
    /// Prefix for rate-control statistics files.
    pub pass_log_prefix: &'a Path,
}

/// Platform null sink for discarded first-pass output.
pub fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Seconds with millisecond precision, trailing zeros trimmed.
pub fn format_secs(secs: f64) -> String {
    let formatted = format!("{:.3}", secs);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// `between(t,a,b)+...` over the kept ranges.
pub fn select_expression(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| {
            format!(
                "between(t,{},{})",
                format_secs(s.start_secs),
                format_secs(s.end_secs)
            )
        })
        .collect::<Vec<_>>()
        .join("+")
}

/// Argument lists for every pass, in execution order.
pub fn build_all_passes(inv: &EncodeInvocation<'_>) -> Result<Vec<Vec<String>>, CatalogError> {
    let passes = if inv.plan.skip_compression {
        1
    } else {
        inv.plan.passes.max(1)
    };
    (1..=passes).map(|pass| build_pass_args(inv, pass)).collect()
}

/// Arguments for `pass` (1-based).
pub fn build_pass_args(inv: &EncodeInvocation<'_>, pass: u8) -> Result<Vec<String>, CatalogError> {
    let plan = inv.plan;
    let multi_segment = plan.segments.len() > 1;
    let analysis_pass = plan.passes > 1 && pass < plan.passes && !plan.skip_compression;

    let mut args: Vec<String> = vec!["-hide_banner".into(), "-nostdin".into(), "-y".into()];

    if let [only] = plan.segments.as_slice() {
        args.push("-ss".into());
        args.push(format_secs(only.start_secs));
        args.push("-to".into());
        args.push(format_secs(only.end_secs));
    }

    args.push("-i".into());
    args.push(inv.input.to_string_lossy().into_owned());
    args.push("-map".into());
    args.push("0:v:0".into());
    if plan.includes_audio() && !analysis_pass {
        args.push("-map".into());
        args.push("0:a:0?".into());
    }

    if plan.skip_compression {
        args.push("-c".into());
        args.push("copy".into());
        push_output(&mut args, inv);
        return Ok(args);
    }

    let mut video_filters = Vec::new();
    if multi_segment {
        video_filters.push(format!(
            "select='{}'",
            select_expression(&plan.segments)
        ));
        video_filters.push("setpts=N/FRAME_RATE/TB".to_string());
    }
    let options = if plan.apply_filters {
        FilterOptions::default()
    } else {
        FilterOptions::none()
    };
    video_filters.extend(build_filter_chain(
        &FilterParams {
            scale_percent: plan.scale_percent,
            fps: plan.resample_fps.then_some(plan.fps),
            target_size_mb: plan.target_size_mb,
            duration_secs: plan.kept_duration_secs,
        },
        &options,
    ));
    if !video_filters.is_empty() {
        args.push("-vf".into());
        args.push(video_filters.join(","));
    }

    args.extend(inv.strategy.build_video_args(plan.video_bitrate_kbps, plan.mode)?);
    if plan.passes > 1 {
        args.extend(inv.strategy.pass_extras(pass, inv.pass_log_prefix));
    }
    // After `-i`, so it reaches the encoder rather than the decoder.
    if let Some(threads) = inv.threads {
        if !inv.strategy.video_encoder().is_hardware() {
            args.push("-threads".into());
            args.push(threads.to_string());
        }
    }

    if analysis_pass {
        args.push("-an".into());
        args.push("-f".into());
        args.push("null".into());
        args.push(null_device().into());
        return Ok(merge_param_flags(args));
    }

    if plan.includes_audio() {
        if multi_segment {
            args.push("-af".into());
            args.push(format!(
                "aselect='{}',asetpts=N/SR/TB",
                select_expression(&plan.segments)
            ));
        }
        args.extend(inv.strategy.build_audio_args(false));
    } else {
        args.extend(inv.strategy.build_audio_args(true));
    }

    push_output(&mut args, inv);
    Ok(merge_param_flags(args))
}

/// MP4-family outputs get their index moved to the front for progressive
/// playback. Decided by the output file, since stream copies keep the source
/// container.
pub fn supports_faststart(output: &Path) -> bool {
    output
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ["mp4", "mov", "m4v"].contains(&e.to_ascii_lowercase().as_str()))
}

fn push_output(args: &mut Vec<String>, inv: &EncodeInvocation<'_>) {
    if supports_faststart(inv.output) {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args.push(inv.output.to_string_lossy().into_owned());
}

/// Collapse repeated parameter-list flags into one colon-joined value, kept
/// at the position of the first occurrence.
pub fn merge_param_flags(args: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if MERGEABLE_PARAM_FLAGS.contains(&arg.as_str()) {
            let Some(value) = iter.next() else {
                out.push(arg);
                break;
            };
            // Flags are always pushed together with their value.
            match out.iter().position(|a| *a == arg) {
                Some(i) => {
                    out[i + 1].push(':');
                    out[i + 1].push_str(&value);
                }
                None => {
                    out.push(arg);
                    out.push(value);
                }
            }
        } else {
            out.push(arg);
        }
    }
    out
}
