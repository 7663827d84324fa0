//! Encoder discovery
//!
//! Finds the best usable encoder per codec by encoding a single synthetic
//! frame with each hardware candidate. Results are cached for the lifetime of
//! the discovery instance; the software encoder is the answer whenever no
//! hardware candidate works.

use crate::encode::catalog::EncoderId;
use crate::request::Codec;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A synthetic one-frame encode that takes longer than this counts as failed.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Variant of the synthetic test encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAttempt {
    /// Forces `-pix_fmt yuv420p`, which some hardware encoders reject.
    WithPixelFormat,
    /// Lets the encoder negotiate its own pixel format.
    Simple,
}

/// Runs one synthetic encode and reports whether it succeeded.
#[async_trait]
pub trait EncoderProbe: Send + Sync {
    async fn try_encode(&self, encoder: EncoderId, attempt: ProbeAttempt) -> bool;
}

/// Probe backed by the ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderProbe {
    ffmpeg_path: PathBuf,
    timeout: Duration,
}

impl FfmpegEncoderProbe {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments for a one-frame encode to the null muxer.
    ///
    /// 256x256 clears the minimum frame size of NVENC.
    pub fn probe_args(encoder: EncoderId, attempt: ProbeAttempt) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "color=c=black:s=256x256:d=0.1",
            "-frames:v",
            "1",
            "-c:v",
            encoder.ffmpeg_name(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if attempt == ProbeAttempt::WithPixelFormat {
            args.push("-pix_fmt".to_string());
            args.push("yuv420p".to_string());
        }
        args.extend(["-f", "null", "-"].iter().map(|s| s.to_string()));
        args
    }
}

#[async_trait]
impl EncoderProbe for FfmpegEncoderProbe {
    async fn try_encode(&self, encoder: EncoderId, attempt: ProbeAttempt) -> bool {
        // kill_on_drop reaps a hung probe once the timeout drops the future.
        let status = Command::new(&self.ffmpeg_path)
            .args(Self::probe_args(encoder, attempt))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(encoder = %encoder, error = %e, "encoder probe could not spawn ffmpeg");
                false
            }
            Err(_) => {
                warn!(encoder = %encoder, timeout = ?self.timeout, "encoder probe timed out");
                false
            }
        }
    }
}

/// Probe that never finds hardware, for software-only setups.
struct SoftwareOnlyProbe;

#[async_trait]
impl EncoderProbe for SoftwareOnlyProbe {
    async fn try_encode(&self, _encoder: EncoderId, _attempt: ProbeAttempt) -> bool {
        false
    }
}

/// One line of the encoder report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEncoder {
    pub codec: Codec,
    pub encoder: EncoderId,
    pub hardware: bool,
}

/// Cached per-codec encoder resolution.
pub struct EncoderDiscovery {
    probe: Arc<dyn EncoderProbe>,
    prefer_hardware: bool,
    resolved: HashMap<Codec, OnceCell<EncoderId>>,
}

impl EncoderDiscovery {
    pub fn new(probe: Arc<dyn EncoderProbe>, prefer_hardware: bool) -> Self {
        Self {
            probe,
            prefer_hardware,
            resolved: Codec::ALL.into_iter().map(|c| (c, OnceCell::new())).collect(),
        }
    }

    /// Discovery that always answers with the software encoder.
    pub fn software_only() -> Self {
        Self::new(Arc::new(SoftwareOnlyProbe), false)
    }

    /// Best usable encoder for `codec`.
    ///
    /// Concurrent callers for the same cold codec share one probe sequence.
    /// Other codecs resolve independently.
    pub async fn resolve(&self, codec: Codec) -> EncoderId {
        let Some(cell) = self.resolved.get(&codec) else {
            return self.probe_codec(codec).await;
        };
        *cell
            .get_or_init(|| async {
                let encoder = self.probe_codec(codec).await;
                info!(
                    codec = %codec,
                    encoder = %encoder,
                    hardware = encoder.is_hardware(),
                    "resolved encoder"
                );
                encoder
            })
            .await
    }

    /// Resolved encoder for every codec.
    pub async fn report(&self) -> Vec<ResolvedEncoder> {
        let mut report = Vec::with_capacity(Codec::ALL.len());
        for codec in Codec::ALL {
            let encoder = self.resolve(codec).await;
            report.push(ResolvedEncoder {
                codec,
                encoder,
                hardware: encoder.is_hardware(),
            });
        }
        report
    }

    async fn probe_codec(&self, codec: Codec) -> EncoderId {
        if self.prefer_hardware {
            let hardware = EncoderId::preference_order(codec)
                .iter()
                .filter(|e| e.is_hardware() && e.family().available_on_this_platform());

            for &candidate in hardware {
                // Retry without a forced pixel format before giving up on it.
                if self
                    .probe
                    .try_encode(candidate, ProbeAttempt::WithPixelFormat)
                    .await
                    || self.probe.try_encode(candidate, ProbeAttempt::Simple).await
                {
                    return candidate;
                }
                debug!(encoder = %candidate, "hardware encoder unavailable");
            }
        }
        EncoderId::software_fallback(codec)
    }
}
