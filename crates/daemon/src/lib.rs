//! Smart Compressor
//!
//! Compresses videos to a target file size: plans a bitrate and resolution
//! budget, picks a usable encoder, builds the ffmpeg argument chain and runs
//! the encodes through a concurrency-limited job queue with progress,
//! cancellation and retry.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod filters;
pub mod jobs;
pub mod metrics;
pub mod metrics_server;
pub mod orchestrator;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod request;
pub mod runner;
pub mod startup;

pub use smart_compressor_config as config;
pub use smart_compressor_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{ffmpeg_collaborators, Daemon, DaemonError};
pub use encode::{CatalogError, CodecStrategy, EncoderDiscovery, EncoderId};
pub use jobs::{CompressionJob, JobStatus, JobStore, JsonDirStore, MemoryStore};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorSettings, RetryError, SubmitError,
};
pub use planner::{CodecPlanningContext, CompressionPlan, PlanningError};
pub use probe::{FfprobeProbe, MetadataProbe, ProbeError, SourceMetadata};
pub use progress::ProgressParser;
pub use request::{Codec, CompressionRequest, EncodeMode, NormalizedRequest, Segment};
pub use runner::{EncoderRunner, FfmpegRunner, RunError, RunOutcome};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
