//! Startup checks module for Smart Compressor
//!
//! Preflight checks run before any job is accepted:
//! - ffprobe availability at the configured path
//! - FFmpeg availability and version (requires 4.0+)

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Oldest FFmpeg major version whose filters and encoder flags we rely on.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshots ("N-112345-g...") carry no release number and return None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Run `<binary> -version` and return its stdout.
fn run_version(binary: &Path) -> Result<String, String> {
    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| format!("failed to run {} -version: {}", binary.display(), e))?;

    if !output.status.success() {
        return Err(format!(
            "{} -version exited with {}",
            binary.display(),
            output.status
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffprobe runs at the configured path
pub fn check_ffprobe_available(ffprobe: &Path) -> Result<(), StartupError> {
    run_version(ffprobe).map_err(StartupError::FfprobeUnavailable)?;
    Ok(())
}

/// Validate parsed `ffmpeg -version` output against [`MIN_FFMPEG_MAJOR`].
pub fn check_version_output(version_output: &str) -> Result<u32, StartupError> {
    let major = parse_ffmpeg_version(version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(major)
}

/// Check that ffmpeg runs at the configured path and is new enough
pub fn check_ffmpeg_version(ffmpeg: &Path) -> Result<u32, StartupError> {
    let output = run_version(ffmpeg).map_err(StartupError::FfmpegVersion)?;
    check_version_output(&output)
}

/// Run all startup checks in order
///
/// 1. FFmpeg version
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_ffmpeg_version(&cfg.encoder.ffmpeg_path)?;
    info!(
        ffmpeg = %cfg.encoder.ffmpeg_path.display(),
        major,
        "ffmpeg version check passed"
    );
    check_ffprobe_available(&cfg.encoder.ffprobe_path)?;
    Ok(())
}
