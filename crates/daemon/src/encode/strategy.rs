//! Codec strategy
//!
//! One concrete strategy type serves every codec. Codecs differ only in their
//! [`CodecProfile`] data and in which encoder discovery picked; argument
//! assembly is shared.

use crate::encode::catalog::{self, CatalogError, EncoderId};
use crate::encode::discovery::EncoderDiscovery;
use crate::planner::CodecPlanningContext;
use crate::request::{Codec, EncodeMode};
use std::path::Path;

/// Container and audio facts for a codec.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecProfile {
    pub codec: Codec,
    pub extension: &'static str,
    pub mime_type: &'static str,
    pub audio_encoder: &'static str,
    pub audio_bitrate_kbps: u32,
    /// Bits per pixel per frame the planner aims for.
    pub target_bpp: f64,
    /// Stream tag some players need, e.g. `hvc1` for HEVC in MP4.
    pub video_tag: Option<&'static str>,
}

static H264_PROFILE: CodecProfile = CodecProfile {
    codec: Codec::H264,
    extension: "mp4",
    mime_type: "video/mp4",
    audio_encoder: "aac",
    audio_bitrate_kbps: 128,
    target_bpp: 0.095,
    video_tag: None,
};

static H265_PROFILE: CodecProfile = CodecProfile {
    codec: Codec::H265,
    extension: "mp4",
    mime_type: "video/mp4",
    audio_encoder: "aac",
    audio_bitrate_kbps: 128,
    target_bpp: 0.065,
    video_tag: Some("hvc1"),
};

static AV1_PROFILE: CodecProfile = CodecProfile {
    codec: Codec::Av1,
    extension: "webm",
    mime_type: "video/webm",
    audio_encoder: "libopus",
    audio_bitrate_kbps: 96,
    target_bpp: 0.050,
    video_tag: None,
};

impl CodecProfile {
    pub fn for_codec(codec: Codec) -> &'static CodecProfile {
        match codec {
            Codec::H264 => &H264_PROFILE,
            Codec::H265 => &H265_PROFILE,
            Codec::Av1 => &AV1_PROFILE,
        }
    }
}

/// Argument builder for one codec bound to one encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecStrategy {
    profile: &'static CodecProfile,
    encoder: EncoderId,
}

impl CodecStrategy {
    /// Strategy using whatever encoder discovery resolves for the codec.
    pub async fn discover(codec: Codec, discovery: &EncoderDiscovery) -> Self {
        let encoder = discovery.resolve(codec).await;
        Self {
            profile: CodecProfile::for_codec(codec),
            encoder,
        }
    }

    /// Strategy pinned to a specific encoder.
    pub fn with_encoder(codec: Codec, encoder: EncoderId) -> Result<Self, CatalogError> {
        if encoder.codec() != codec {
            return Err(CatalogError::CodecMismatch { codec, encoder });
        }
        Ok(Self {
            profile: CodecProfile::for_codec(codec),
            encoder,
        })
    }

    pub fn codec(&self) -> Codec {
        self.profile.codec
    }

    pub fn profile(&self) -> &'static CodecProfile {
        self.profile
    }

    pub fn extension(&self) -> &'static str {
        self.profile.extension
    }

    pub fn mime_type(&self) -> &'static str {
        self.profile.mime_type
    }

    pub fn video_encoder(&self) -> EncoderId {
        self.encoder
    }

    pub fn audio_encoder(&self) -> &'static str {
        self.profile.audio_encoder
    }

    /// What the planner needs to know about this codec and encoder.
    pub fn planning_context(&self) -> CodecPlanningContext {
        CodecPlanningContext {
            codec: self.profile.codec,
            extension: self.profile.extension,
            audio_bitrate_kbps: self.profile.audio_bitrate_kbps,
            target_bpp: self.profile.target_bpp,
            supports_pass_log: self.encoder.supports_pass_log(),
        }
    }

    /// Encoder selection, target bitrate and catalog tuning.
    ///
    /// Rate constraints the tuning row did not spell out are appended from
    /// its multipliers.
    pub fn build_video_args(
        &self,
        bitrate_kbps: u32,
        mode: EncodeMode,
    ) -> Result<Vec<String>, CatalogError> {
        let tuning = catalog::lookup(self.profile.codec, self.encoder, mode)?;

        let mut args = vec![
            "-c:v".to_string(),
            self.encoder.ffmpeg_name().to_string(),
            "-b:v".to_string(),
            format!("{}k", bitrate_kbps),
        ];
        args.extend(tuning.render(bitrate_kbps));

        let constraints = [
            ("-maxrate", tuning.max_rate_kbps(bitrate_kbps)),
            ("-minrate", tuning.min_rate_kbps(bitrate_kbps)),
            ("-bufsize", tuning.buf_size_kbps(bitrate_kbps)),
        ];
        for (flag, value) in constraints {
            if let Some(kbps) = value {
                if !args.iter().any(|a| a == flag) {
                    args.push(flag.to_string());
                    args.push(format!("{}k", kbps));
                }
            }
        }

        if let Some(tag) = self.profile.video_tag {
            args.push("-tag:v".to_string());
            args.push(tag.to_string());
        }

        // Hardware encoders negotiate their own surface format.
        if !self.encoder.is_hardware() {
            args.push("-pix_fmt".to_string());
            args.push("yuv420p".to_string());
        }

        Ok(args)
    }

    /// Audio codec and bitrate, or `-an` when muted.
    pub fn build_audio_args(&self, mute: bool) -> Vec<String> {
        if mute {
            return vec!["-an".to_string()];
        }
        vec![
            "-c:a".to_string(),
            self.profile.audio_encoder.to_string(),
            "-b:a".to_string(),
            format!("{}k", self.profile.audio_bitrate_kbps),
        ]
    }

    /// Two-pass bookkeeping flags for `pass` (1 or 2).
    ///
    /// Empty for encoders without pass-log support.
    pub fn pass_extras(&self, pass: u8, log_prefix: &Path) -> Vec<String> {
        let prefix = log_prefix.to_string_lossy();
        match self.encoder {
            EncoderId::Libx264 => vec![
                "-pass".to_string(),
                pass.to_string(),
                "-passlogfile".to_string(),
                prefix.into_owned(),
            ],
            EncoderId::Libx265 => vec![
                "-x265-params".to_string(),
                format!("pass={}:stats={}.log", pass, prefix),
            ],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_x264_video_args() {
        let strategy = CodecStrategy::with_encoder(Codec::H264, EncoderId::Libx264).unwrap();
        let args = strategy.build_video_args(400, EncodeMode::Fast).unwrap();

        assert_eq!(&args[..4], &["-c:v", "libx264", "-b:v", "400k"]);
        assert_eq!(value_after(&args, "-maxrate"), Some("600k"));
        assert_eq!(value_after(&args, "-bufsize"), Some("800k"));
        assert_eq!(args.iter().filter(|a| *a == "-maxrate").count(), 1);
        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p"));
        assert!(!args.iter().any(|a| a == "-minrate"));
    }

    #[test]
    fn test_wildcard_tuning_gets_constraints_appended() {
        let strategy = CodecStrategy::with_encoder(Codec::H265, EncoderId::HevcQsv).unwrap();
        let args = strategy.build_video_args(1000, EncodeMode::Fast).unwrap();

        assert_eq!(value_after(&args, "-maxrate"), Some("1500k"));
        assert_eq!(value_after(&args, "-bufsize"), Some("2000k"));
        assert_eq!(value_after(&args, "-tag:v"), Some("hvc1"));
        assert!(!args.iter().any(|a| a == "-pix_fmt"));
    }

    #[test]
    fn test_svtav1_has_no_peak_rate() {
        let strategy = CodecStrategy::with_encoder(Codec::Av1, EncoderId::LibSvtAv1).unwrap();
        let args = strategy.build_video_args(500, EncodeMode::Quality).unwrap();
        assert!(!args.iter().any(|a| a == "-maxrate"));
        assert_eq!(value_after(&args, "-svtav1-params"), Some("tune=0:enable-overlays=1"));
    }

    #[test]
    fn test_audio_args() {
        let avc = CodecStrategy::with_encoder(Codec::H264, EncoderId::Libx264).unwrap();
        assert_eq!(avc.build_audio_args(false), vec!["-c:a", "aac", "-b:a", "128k"]);
        assert_eq!(avc.build_audio_args(true), vec!["-an"]);

        let av1 = CodecStrategy::with_encoder(Codec::Av1, EncoderId::Av1Nvenc).unwrap();
        assert_eq!(av1.build_audio_args(false), vec!["-c:a", "libopus", "-b:a", "96k"]);
        assert_eq!(av1.extension(), "webm");
        assert_eq!(av1.mime_type(), "video/webm");
    }

    #[test]
    fn test_pass_extras() {
        let prefix = PathBuf::from("/tmp/job/passlog");

        let x264 = CodecStrategy::with_encoder(Codec::H264, EncoderId::Libx264).unwrap();
        assert_eq!(
            x264.pass_extras(1, &prefix),
            vec!["-pass", "1", "-passlogfile", "/tmp/job/passlog"]
        );

        let x265 = CodecStrategy::with_encoder(Codec::H265, EncoderId::Libx265).unwrap();
        assert_eq!(
            x265.pass_extras(2, &prefix),
            vec!["-x265-params", "pass=2:stats=/tmp/job/passlog.log"]
        );

        let nvenc = CodecStrategy::with_encoder(Codec::H264, EncoderId::H264Nvenc).unwrap();
        assert!(nvenc.pass_extras(1, &prefix).is_empty());
    }

    #[test]
    fn test_planning_context_tracks_encoder() {
        let sw = CodecStrategy::with_encoder(Codec::H265, EncoderId::Libx265).unwrap();
        let ctx = sw.planning_context();
        assert!(ctx.supports_pass_log);
        assert_eq!(ctx.target_bpp, 0.065);
        assert_eq!(ctx.audio_bitrate_kbps, 128);

        let hw = CodecStrategy::with_encoder(Codec::H265, EncoderId::HevcNvenc).unwrap();
        assert!(!hw.planning_context().supports_pass_log);
    }

    #[test]
    fn test_mismatched_encoder_rejected() {
        assert!(CodecStrategy::with_encoder(Codec::Av1, EncoderId::Libx264).is_err());
    }

    #[tokio::test]
    async fn test_discover_uses_discovery() {
        let discovery = EncoderDiscovery::software_only();
        let strategy = CodecStrategy::discover(Codec::H264, &discovery).await;
        assert_eq!(strategy.video_encoder(), EncoderId::Libx264);
        assert_eq!(strategy.audio_encoder(), "aac");
    }
}
