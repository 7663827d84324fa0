//! Encoder identities and the tuning catalog
//!
//! Every usable ffmpeg video encoder is an [`EncoderId`] variant. The catalog
//! maps (codec, encoder-or-any, mode) to encoder flags plus rate-constraint
//! multipliers. Lookup prefers an exact encoder entry and falls back to the
//! codec's wildcard entry; it never borrows another codec's table.

use crate::request::{Codec, EncodeMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for catalog lookups
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// No exact or wildcard entry exists for the combination
    #[error("no tuning entry for codec {codec}, encoder {encoder}, mode {mode}")]
    MissingEntry {
        codec: Codec,
        encoder: EncoderId,
        mode: EncodeMode,
    },

    /// The encoder produces a different codec than the one requested
    #[error("encoder {encoder} cannot produce {codec}")]
    CodecMismatch { codec: Codec, encoder: EncoderId },
}

/// Hardware vendor family, or software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFamily {
    Nvenc,
    Qsv,
    Amf,
    VideoToolbox,
    Software,
}

impl EncoderFamily {
    /// Whether the family can exist on the platform this binary was built for.
    pub fn available_on_this_platform(&self) -> bool {
        match self {
            EncoderFamily::Amf => cfg!(target_os = "windows"),
            EncoderFamily::VideoToolbox => cfg!(target_os = "macos"),
            _ => true,
        }
    }
}

/// A concrete ffmpeg video encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncoderId {
    #[serde(rename = "libx264")]
    Libx264,
    #[serde(rename = "h264_nvenc")]
    H264Nvenc,
    #[serde(rename = "h264_qsv")]
    H264Qsv,
    #[serde(rename = "h264_amf")]
    H264Amf,
    #[serde(rename = "h264_videotoolbox")]
    H264VideoToolbox,
    #[serde(rename = "libx265")]
    Libx265,
    #[serde(rename = "hevc_nvenc")]
    HevcNvenc,
    #[serde(rename = "hevc_qsv")]
    HevcQsv,
    #[serde(rename = "hevc_amf")]
    HevcAmf,
    #[serde(rename = "hevc_videotoolbox")]
    HevcVideoToolbox,
    #[serde(rename = "libsvtav1")]
    LibSvtAv1,
    #[serde(rename = "av1_nvenc")]
    Av1Nvenc,
    #[serde(rename = "av1_qsv")]
    Av1Qsv,
    #[serde(rename = "av1_amf")]
    Av1Amf,
}

const H264_PREFERENCE: [EncoderId; 5] = [
    EncoderId::H264Nvenc,
    EncoderId::H264Qsv,
    EncoderId::H264Amf,
    EncoderId::H264VideoToolbox,
    EncoderId::Libx264,
];

const H265_PREFERENCE: [EncoderId; 5] = [
    EncoderId::HevcNvenc,
    EncoderId::HevcQsv,
    EncoderId::HevcAmf,
    EncoderId::HevcVideoToolbox,
    EncoderId::Libx265,
];

const AV1_PREFERENCE: [EncoderId; 4] = [
    EncoderId::Av1Nvenc,
    EncoderId::Av1Qsv,
    EncoderId::Av1Amf,
    EncoderId::LibSvtAv1,
];

impl EncoderId {
    pub const ALL: [EncoderId; 14] = [
        EncoderId::Libx264,
        EncoderId::H264Nvenc,
        EncoderId::H264Qsv,
        EncoderId::H264Amf,
        EncoderId::H264VideoToolbox,
        EncoderId::Libx265,
        EncoderId::HevcNvenc,
        EncoderId::HevcQsv,
        EncoderId::HevcAmf,
        EncoderId::HevcVideoToolbox,
        EncoderId::LibSvtAv1,
        EncoderId::Av1Nvenc,
        EncoderId::Av1Qsv,
        EncoderId::Av1Amf,
    ];

    /// Name passed to `-c:v`.
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            EncoderId::Libx264 => "libx264",
            EncoderId::H264Nvenc => "h264_nvenc",
            EncoderId::H264Qsv => "h264_qsv",
            EncoderId::H264Amf => "h264_amf",
            EncoderId::H264VideoToolbox => "h264_videotoolbox",
            EncoderId::Libx265 => "libx265",
            EncoderId::HevcNvenc => "hevc_nvenc",
            EncoderId::HevcQsv => "hevc_qsv",
            EncoderId::HevcAmf => "hevc_amf",
            EncoderId::HevcVideoToolbox => "hevc_videotoolbox",
            EncoderId::LibSvtAv1 => "libsvtav1",
            EncoderId::Av1Nvenc => "av1_nvenc",
            EncoderId::Av1Qsv => "av1_qsv",
            EncoderId::Av1Amf => "av1_amf",
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            EncoderId::Libx264
            | EncoderId::H264Nvenc
            | EncoderId::H264Qsv
            | EncoderId::H264Amf
            | EncoderId::H264VideoToolbox => Codec::H264,
            EncoderId::Libx265
            | EncoderId::HevcNvenc
            | EncoderId::HevcQsv
            | EncoderId::HevcAmf
            | EncoderId::HevcVideoToolbox => Codec::H265,
            EncoderId::LibSvtAv1 | EncoderId::Av1Nvenc | EncoderId::Av1Qsv | EncoderId::Av1Amf => {
                Codec::Av1
            }
        }
    }

    pub fn family(&self) -> EncoderFamily {
        match self {
            EncoderId::H264Nvenc | EncoderId::HevcNvenc | EncoderId::Av1Nvenc => {
                EncoderFamily::Nvenc
            }
            EncoderId::H264Qsv | EncoderId::HevcQsv | EncoderId::Av1Qsv => EncoderFamily::Qsv,
            EncoderId::H264Amf | EncoderId::HevcAmf | EncoderId::Av1Amf => EncoderFamily::Amf,
            EncoderId::H264VideoToolbox | EncoderId::HevcVideoToolbox => {
                EncoderFamily::VideoToolbox
            }
            EncoderId::Libx264 | EncoderId::Libx265 | EncoderId::LibSvtAv1 => {
                EncoderFamily::Software
            }
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.family() != EncoderFamily::Software
    }

    /// Two-pass rate control through a statistics log.
    pub fn supports_pass_log(&self) -> bool {
        matches!(self, EncoderId::Libx264 | EncoderId::Libx265)
    }

    /// Candidates for a codec in preference order, software last.
    pub fn preference_order(codec: Codec) -> &'static [EncoderId] {
        match codec {
            Codec::H264 => &H264_PREFERENCE,
            Codec::H265 => &H265_PREFERENCE,
            Codec::Av1 => &AV1_PREFERENCE,
        }
    }

    /// The encoder that is always assumed present.
    pub fn software_fallback(codec: Codec) -> EncoderId {
        match codec {
            Codec::H264 => EncoderId::Libx264,
            Codec::H265 => EncoderId::Libx265,
            Codec::Av1 => EncoderId::LibSvtAv1,
        }
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

impl FromStr for EncoderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        EncoderId::ALL
            .iter()
            .copied()
            .find(|e| e.ffmpeg_name() == name)
            .ok_or_else(|| format!("unknown encoder '{}'", name))
    }
}

/// Which encoders an entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMatch {
    Exact(EncoderId),
    Any,
}

/// One token of a tuning flag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningArg {
    Lit(&'static str),
    /// Planned bitrate times the max-rate multiplier, e.g. `600k`
    MaxRate,
    MinRate,
    BufSize,
}

/// Tuning for one (codec, encoder, mode) combination.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingModeConfig {
    pub codec: Codec,
    pub encoder: EncoderMatch,
    pub mode: EncodeMode,
    pub args: &'static [TuningArg],
    /// `None` leaves the constraint to the encoder.
    pub max_rate_multiplier: Option<f64>,
    pub min_rate_multiplier: Option<f64>,
    pub buf_size_multiplier: Option<f64>,
}

impl EncodingModeConfig {
    pub fn max_rate_kbps(&self, bitrate_kbps: u32) -> Option<u32> {
        self.max_rate_multiplier.map(|m| scale_rate(bitrate_kbps, m))
    }

    pub fn min_rate_kbps(&self, bitrate_kbps: u32) -> Option<u32> {
        self.min_rate_multiplier.map(|m| scale_rate(bitrate_kbps, m))
    }

    pub fn buf_size_kbps(&self, bitrate_kbps: u32) -> Option<u32> {
        self.buf_size_multiplier.map(|m| scale_rate(bitrate_kbps, m))
    }

    /// Render the flag list with rate placeholders substituted.
    ///
    /// A placeholder whose multiplier is `None` is dropped together with the
    /// flag name preceding it.
    pub fn render(&self, bitrate_kbps: u32) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.args.len());
        for arg in self.args {
            let value = match arg {
                TuningArg::Lit(s) => {
                    out.push((*s).to_string());
                    continue;
                }
                TuningArg::MaxRate => self.max_rate_kbps(bitrate_kbps),
                TuningArg::MinRate => self.min_rate_kbps(bitrate_kbps),
                TuningArg::BufSize => self.buf_size_kbps(bitrate_kbps),
            };
            match value {
                Some(kbps) => out.push(format!("{}k", kbps)),
                None => {
                    out.pop();
                }
            }
        }
        out
    }
}

fn scale_rate(bitrate_kbps: u32, multiplier: f64) -> u32 {
    (bitrate_kbps as f64 * multiplier).round() as u32
}

use EncodeMode::{Fast, Quality};
use TuningArg::{BufSize, Lit, MaxRate, MinRate};

const fn entry(
    codec: Codec,
    encoder: EncoderMatch,
    mode: EncodeMode,
    args: &'static [TuningArg],
    max_rate: Option<f64>,
    buf_size: Option<f64>,
) -> EncodingModeConfig {
    EncodingModeConfig {
        codec,
        encoder,
        mode,
        args,
        max_rate_multiplier: max_rate,
        min_rate_multiplier: None,
        buf_size_multiplier: buf_size,
    }
}

impl EncodingModeConfig {
    /// Add a rate floor to a table row.
    const fn with_min_rate(self, min_rate: f64) -> Self {
        EncodingModeConfig {
            min_rate_multiplier: Some(min_rate),
            ..self
        }
    }
}

const GOP_ONLY: &[TuningArg] = &[Lit("-g"), Lit("250")];

#[rustfmt::skip]
static TABLE: &[EncodingModeConfig] = &[
    // Wildcards: flags every encoder of the codec accepts.
    entry(Codec::H264, EncoderMatch::Any, Fast, GOP_ONLY, Some(1.5), Some(2.0)),
    entry(Codec::H264, EncoderMatch::Any, Quality, GOP_ONLY, Some(1.3), Some(2.0)),
    entry(Codec::H265, EncoderMatch::Any, Fast, GOP_ONLY, Some(1.5), Some(2.0)),
    entry(Codec::H265, EncoderMatch::Any, Quality, GOP_ONLY, Some(1.3), Some(2.0)),
    entry(Codec::Av1, EncoderMatch::Any, Fast, GOP_ONLY, Some(1.5), Some(2.0)),
    entry(Codec::Av1, EncoderMatch::Any, Quality, GOP_ONLY, Some(1.3), Some(2.0)),
    // H.264
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::Libx264),
        Fast,
        &[
            Lit("-preset"), Lit("faster"),
            Lit("-profile:v"), Lit("high"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
            Lit("-aq-mode"), Lit("1"),
            Lit("-maxrate"), MaxRate,
            Lit("-bufsize"), BufSize,
        ],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::Libx264),
        Quality,
        &[
            Lit("-preset"), Lit("slow"),
            Lit("-profile:v"), Lit("high"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
            Lit("-refs"), Lit("4"),
            Lit("-aq-mode"), Lit("2"),
            Lit("-rc-lookahead"), Lit("50"),
            Lit("-minrate"), MinRate,
            Lit("-maxrate"), MaxRate,
            Lit("-bufsize"), BufSize,
        ],
        Some(1.3),
        Some(2.0),
    )
    .with_min_rate(0.5),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Nvenc),
        Fast,
        &[
            Lit("-preset"), Lit("p4"),
            Lit("-tune"), Lit("hq"),
            Lit("-rc"), Lit("vbr"),
            Lit("-rc-lookahead"), Lit("20"),
            Lit("-spatial-aq"), Lit("1"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
        ],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Nvenc),
        Quality,
        &[
            Lit("-preset"), Lit("p7"),
            Lit("-tune"), Lit("hq"),
            Lit("-rc"), Lit("vbr"),
            Lit("-multipass"), Lit("fullres"),
            Lit("-rc-lookahead"), Lit("32"),
            Lit("-spatial-aq"), Lit("1"),
            Lit("-temporal-aq"), Lit("1"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Qsv),
        Fast,
        &[Lit("-preset"), Lit("faster"), Lit("-g"), Lit("250")],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Qsv),
        Quality,
        &[
            Lit("-preset"), Lit("slower"),
            Lit("-look_ahead"), Lit("1"),
            Lit("-look_ahead_depth"), Lit("40"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Amf),
        Fast,
        &[Lit("-quality"), Lit("speed"), Lit("-rc"), Lit("vbr_peak"), Lit("-g"), Lit("250")],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H264,
        EncoderMatch::Exact(EncoderId::H264Amf),
        Quality,
        &[
            Lit("-quality"), Lit("quality"),
            Lit("-rc"), Lit("vbr_peak"),
            Lit("-g"), Lit("250"),
            Lit("-bf"), Lit("3"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    // H.265
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::Libx265),
        Fast,
        &[
            Lit("-preset"), Lit("fast"),
            Lit("-g"), Lit("250"),
            Lit("-x265-params"), Lit("aq-mode=3"),
            Lit("-maxrate"), MaxRate,
            Lit("-bufsize"), BufSize,
        ],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::Libx265),
        Quality,
        &[
            Lit("-preset"), Lit("slow"),
            Lit("-g"), Lit("250"),
            Lit("-x265-params"), Lit("aq-mode=3:rc-lookahead=40:bframes=4"),
            Lit("-minrate"), MinRate,
            Lit("-maxrate"), MaxRate,
            Lit("-bufsize"), BufSize,
        ],
        Some(1.3),
        Some(2.0),
    )
    .with_min_rate(0.5),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::HevcNvenc),
        Fast,
        &[
            Lit("-preset"), Lit("p4"),
            Lit("-tune"), Lit("hq"),
            Lit("-rc"), Lit("vbr"),
            Lit("-spatial-aq"), Lit("1"),
            Lit("-g"), Lit("250"),
        ],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::HevcNvenc),
        Quality,
        &[
            Lit("-preset"), Lit("p7"),
            Lit("-tune"), Lit("hq"),
            Lit("-rc"), Lit("vbr"),
            Lit("-multipass"), Lit("fullres"),
            Lit("-rc-lookahead"), Lit("32"),
            Lit("-spatial-aq"), Lit("1"),
            Lit("-temporal-aq"), Lit("1"),
            Lit("-g"), Lit("250"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::HevcQsv),
        Quality,
        &[
            Lit("-preset"), Lit("slower"),
            Lit("-look_ahead_depth"), Lit("40"),
            Lit("-g"), Lit("250"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::HevcAmf),
        Fast,
        &[Lit("-quality"), Lit("speed"), Lit("-rc"), Lit("vbr_peak"), Lit("-g"), Lit("250")],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::H265,
        EncoderMatch::Exact(EncoderId::HevcAmf),
        Quality,
        &[Lit("-quality"), Lit("quality"), Lit("-rc"), Lit("vbr_peak"), Lit("-g"), Lit("250")],
        Some(1.3),
        Some(2.0),
    ),
    // AV1: SVT-AV1 rejects a peak rate outside CRF mode.
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::LibSvtAv1),
        Fast,
        &[
            Lit("-preset"), Lit("10"),
            Lit("-g"), Lit("250"),
            Lit("-svtav1-params"), Lit("tune=0"),
        ],
        None,
        None,
    ),
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::LibSvtAv1),
        Quality,
        &[
            Lit("-preset"), Lit("6"),
            Lit("-g"), Lit("250"),
            Lit("-svtav1-params"), Lit("tune=0:enable-overlays=1"),
        ],
        None,
        None,
    ),
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::Av1Nvenc),
        Fast,
        &[Lit("-preset"), Lit("p4"), Lit("-tune"), Lit("hq"), Lit("-rc"), Lit("vbr"), Lit("-g"), Lit("250")],
        Some(1.5),
        Some(2.0),
    ),
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::Av1Nvenc),
        Quality,
        &[
            Lit("-preset"), Lit("p7"),
            Lit("-tune"), Lit("hq"),
            Lit("-rc"), Lit("vbr"),
            Lit("-multipass"), Lit("fullres"),
            Lit("-g"), Lit("250"),
        ],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::Av1Qsv),
        Quality,
        &[Lit("-preset"), Lit("slower"), Lit("-g"), Lit("250")],
        Some(1.3),
        Some(2.0),
    ),
    entry(
        Codec::Av1,
        EncoderMatch::Exact(EncoderId::Av1Amf),
        Fast,
        &[Lit("-quality"), Lit("speed"), Lit("-g"), Lit("250")],
        Some(1.5),
        Some(2.0),
    ),
];

/// Every catalog entry, wildcards first.
pub fn entries() -> &'static [EncodingModeConfig] {
    TABLE
}

/// Resolve the tuning for an encoder, falling back to the codec wildcard.
pub fn lookup(
    codec: Codec,
    encoder: EncoderId,
    mode: EncodeMode,
) -> Result<&'static EncodingModeConfig, CatalogError> {
    if encoder.codec() != codec {
        return Err(CatalogError::CodecMismatch { codec, encoder });
    }

    let for_codec_mode = || TABLE.iter().filter(|e| e.codec == codec && e.mode == mode);

    for_codec_mode()
        .find(|e| e.encoder == EncoderMatch::Exact(encoder))
        .or_else(|| for_codec_mode().find(|e| e.encoder == EncoderMatch::Any))
        .ok_or(CatalogError::MissingEntry {
            codec,
            encoder,
            mode,
        })
}
