//! Filter chain builder
//!
//! Derives the ffmpeg video filter stages for a plan. Stage order is fixed:
//! denoise, scale, deband, sharpen, fps. Debanding runs after scaling so it
//! works on the final pixel grid.

use serde::{Deserialize, Serialize};

/// Implied bitrate (kbps) under which compression counts as heavy.
const HEAVY_BELOW_KBPS: f64 = 900.0;

/// Implied bitrate (kbps) under which compression counts as moderate.
const MODERATE_BELOW_KBPS: f64 = 2000.0;

const MAX_SHARPEN_STRENGTH: f64 = 0.8;

/// How hard the encoder is being squeezed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Light,
    Moderate,
    Heavy,
}

impl Intensity {
    /// Classify from the total bitrate a target size implies over a duration.
    ///
    /// Without a target (or without a usable duration) the intensity is Light.
    pub fn classify(target_size_mb: Option<f64>, duration_secs: f64) -> Self {
        let implied_kbps = match target_size_mb {
            Some(mb) if duration_secs > 0.0 => mb * 8192.0 / duration_secs,
            _ => return Intensity::Light,
        };
        if implied_kbps < HEAVY_BELOW_KBPS {
            Intensity::Heavy
        } else if implied_kbps < MODERATE_BELOW_KBPS {
            Intensity::Moderate
        } else {
            Intensity::Light
        }
    }

    /// hqdn3d luma_spatial:chroma_spatial:luma_tmp:chroma_tmp, or None to skip.
    fn denoise_params(self) -> Option<&'static str> {
        match self {
            Intensity::Heavy => Some("4:3:6:4.5"),
            Intensity::Moderate => Some("2:1.5:3:2.25"),
            Intensity::Light => None,
        }
    }

    /// (threshold, range)
    fn deband_params(self) -> (f64, u32) {
        match self {
            Intensity::Heavy => (0.04, 20),
            Intensity::Moderate => (0.03, 16),
            Intensity::Light => (0.02, 12),
        }
    }
}

/// Independent toggles for each stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub denoise: bool,
    pub scale: bool,
    pub deband: bool,
    pub sharpen: bool,
    pub fps: bool,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            denoise: true,
            scale: true,
            deband: true,
            sharpen: true,
            fps: true,
        }
    }
}

impl FilterOptions {
    /// Everything off, for stream copy and plain trims.
    pub fn none() -> Self {
        Self {
            denoise: false,
            scale: false,
            deband: false,
            sharpen: false,
            fps: false,
        }
    }
}

/// Inputs to the chain, all taken from a plan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub scale_percent: u32,
    /// Resample target; None keeps the source timing.
    pub fps: Option<u32>,
    pub target_size_mb: Option<f64>,
    pub duration_secs: f64,
}

/// Build the ordered filter list. Empty when every applicable stage is off.
pub fn build_filter_chain(params: &FilterParams, options: &FilterOptions) -> Vec<String> {
    let intensity = Intensity::classify(params.target_size_mb, params.duration_secs);
    let downscaled = params.scale_percent < 100;
    let scale = params.scale_percent as f64 / 100.0;
    let mut chain = Vec::new();

    if options.denoise {
        if let Some(denoise) = intensity.denoise_params() {
            chain.push(format!("hqdn3d={}", denoise));
        }
    }

    if options.scale && downscaled {
        chain.push(format!(
            "scale=trunc(iw*{s}/2)*2:trunc(ih*{s}/2)*2:flags=lanczos",
            s = format_decimal(scale)
        ));
    }

    if options.deband {
        let (threshold, range) = intensity.deband_params();
        let t = format_decimal(threshold);
        chain.push(format!("deband=1thr={t}:2thr={t}:3thr={t}:range={range}"));
    }

    // Sharpening compensates scaler softness, so it follows the downscale.
    if options.sharpen && downscaled {
        let strength = (0.3 + 0.5 * (1.0 - scale)).min(MAX_SHARPEN_STRENGTH);
        chain.push(format!("cas=strength={}", format_decimal(strength)));
    }

    if let Some(fps) = params.fps.filter(|fps| options.fps && *fps > 0) {
        chain.push(format!("fps={}", fps));
    }

    chain
}

/// Up to three decimals, trailing zeros trimmed.
fn format_decimal(value: f64) -> String {
    let formatted = format!("{:.3}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}
