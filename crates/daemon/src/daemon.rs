//! Daemon assembly for Smart Compressor
//!
//! Builds the orchestrator and its collaborators from configuration, runs the
//! startup checks and starts the optional metrics endpoint and housekeeping.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::discovery::{EncoderDiscovery, FfmpegEncoderProbe};
use crate::jobs::{current_timestamp_ms, JsonDirStore};
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
use crate::probe::FfprobeProbe;
use crate::runner::FfmpegRunner;
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// How often the metrics snapshot is rebuilt from the job table.
const METRICS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// How often expired outputs are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Persisted jobs could not be loaded
    #[error("Failed to restore jobs: {0}")]
    Restore(#[from] std::io::Error),
}

/// Collaborators backed by the configured ffmpeg/ffprobe binaries and a JSON
/// job store in the state directory.
pub fn ffmpeg_collaborators(config: &Config) -> Collaborators {
    let encoder_probe = Arc::new(FfmpegEncoderProbe::new(config.encoder.ffmpeg_path.clone()));
    Collaborators {
        probe: Arc::new(FfprobeProbe::new(config.encoder.ffprobe_path.clone())),
        runner: Arc::new(FfmpegRunner::new(config.encoder.ffmpeg_path.clone())),
        store: Arc::new(JsonDirStore::new(config.paths.state_dir.clone())),
        discovery: Arc::new(EncoderDiscovery::new(
            encoder_probe,
            config.encoder.prefer_hardware,
        )),
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    /// Job orchestrator
    pub orchestrator: Orchestrator,
}

impl Daemon {
    /// Load configuration (missing file means defaults), run the startup
    /// checks and assemble the daemon.
    pub async fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::new(config).await
    }

    /// Initialize the daemon with an existing configuration
    ///
    /// Startup sequence:
    /// 1. Run startup checks (ffmpeg version, ffprobe)
    /// 2. Derive concurrency plan
    /// 3. Build collaborators and the orchestrator
    /// 4. Restore persisted jobs
    pub async fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        let collaborators = ffmpeg_collaborators(&config);
        Self::with_collaborators(config, collaborators).await
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful when ffmpeg is not installed, e.g. for planning previews.
    pub async fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let collaborators = ffmpeg_collaborators(&config);
        Self::with_collaborators(config, collaborators).await
    }

    /// Assemble the daemon around caller-supplied collaborators.
    pub async fn with_collaborators(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        info!(
            total_cores = concurrency_plan.total_cores,
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            threads_per_job = concurrency_plan.threads_per_job,
            "concurrency plan derived"
        );

        let metrics = new_shared_metrics();
        let settings = OrchestratorSettings::from_config(&config, &concurrency_plan);
        let orchestrator = Orchestrator::new(settings, collaborators, metrics.clone());
        orchestrator.restore().await?;

        Ok(Self {
            config,
            concurrency_plan,
            metrics,
            orchestrator,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Start the metrics HTTP server when enabled in configuration.
    pub fn start_metrics_server(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.metrics.enabled {
            return None;
        }
        let metrics = self.metrics.clone();
        let bind = self.config.metrics.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind).await {
                error!(error = %e, "metrics server stopped");
            }
        }))
    }

    /// Keep the metrics snapshot current and sweep expired outputs.
    pub fn start_housekeeping(&self) -> tokio::task::JoinHandle<()> {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(METRICS_REFRESH_INTERVAL);
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = refresh.tick() => orchestrator.refresh_metrics().await,
                    _ = sweep.tick() => {
                        orchestrator.sweep_expired(current_timestamp_ms()).await;
                    }
                }
            }
        })
    }
}
