//! CLI entry point for Smart Compressor
//!
//! Submits compressions, previews plans and reports the encoders this
//! machine can use.

use clap::{Args, Parser, Subcommand};
use smart_compressor::config::LoggingConfig;
use smart_compressor::{
    CompressionJob, CompressionRequest, Config, Daemon, DaemonError, JobStatus, Segment,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Smart Compressor - compress videos to a target file size
#[derive(Parser, Debug)]
#[command(name = "smart-compressor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (config.toml). Missing means defaults.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg version, ffprobe)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress one or more videos and wait for the results
    Compress {
        /// Source videos
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        request: RequestArgs,
    },
    /// Print the plan and encoder arguments for a video as JSON
    Plan {
        input: PathBuf,

        #[command(flatten)]
        request: RequestArgs,
    },
    /// Show the encoder selected for each codec
    Encoders,
}

#[derive(Args, Debug, Clone)]
struct RequestArgs {
    /// Output codec: h264, h265 or av1
    #[arg(long, default_value = "h264")]
    codec: String,

    /// Target output size in MB
    #[arg(long = "target-size", value_name = "MB")]
    target_size_mb: Option<f64>,

    /// Output scale in percent (rounded down to a multiple of 5)
    #[arg(long = "scale", value_name = "PCT")]
    scale_percent: Option<u32>,

    /// Output frame rate
    #[arg(long = "fps")]
    fps: Option<u32>,

    /// Kept range in seconds, e.g. 12.5-40. Repeatable.
    #[arg(long = "segment", value_name = "START-END")]
    segments: Vec<Segment>,

    /// Drop the audio track
    #[arg(long)]
    mute: bool,

    /// Stream-copy when possible instead of re-encoding
    #[arg(long)]
    skip: bool,

    /// Slower, higher quality encoder settings
    #[arg(long)]
    quality: bool,
}

impl RequestArgs {
    fn to_request(&self) -> CompressionRequest {
        CompressionRequest {
            target_size_mb: self.target_size_mb,
            scale_percent: self.scale_percent,
            target_fps: self.fps,
            segments: self.segments.clone(),
            mute_audio: self.mute,
            skip_compression: self.skip,
            quality_mode: self.quality,
            ..CompressionRequest::new(self.codec.clone())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_daemon(config: Config, run_checks: bool) -> Result<Daemon, DaemonError> {
    if run_checks {
        Daemon::new(config).await
    } else {
        Daemon::new_without_checks(config).await
    }
}

fn status_line(job: &CompressionJob) -> String {
    match job.status {
        JobStatus::Queued => format!(
            "{}  queued (position {})",
            job.original_filename,
            job.queue_position.map(|p| p + 1).unwrap_or(1)
        ),
        JobStatus::Processing => match job.eta_secs {
            Some(eta) => format!(
                "{}  {:5.1}%  eta {:.0}s",
                job.original_filename, job.progress, eta
            ),
            None => format!("{}  {:5.1}%", job.original_filename, job.progress),
        },
        JobStatus::Completed => format!(
            "{}  done -> {} ({} bytes)",
            job.original_filename,
            job.output_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            job.output_size_bytes.unwrap_or(0)
        ),
        JobStatus::Failed => format!(
            "{}  failed: {}",
            job.original_filename,
            job.error.as_deref().unwrap_or("unknown error")
        ),
        JobStatus::Cancelled => format!("{}  cancelled", job.original_filename),
    }
}

async fn compress(daemon: &Daemon, inputs: &[PathBuf], request: CompressionRequest) -> ExitCode {
    let orchestrator = &daemon.orchestrator;
    let _metrics_server = daemon.start_metrics_server();
    let housekeeping = daemon.start_housekeeping();

    let mut ids = Vec::with_capacity(inputs.len());
    let mut rejected = false;
    for input in inputs {
        match orchestrator.submit(request.clone(), input).await {
            Ok(id) => ids.push(id),
            Err(e) => {
                error!(input = %input.display(), error = %e, "submission rejected");
                eprintln!("{}: {}", input.display(), e);
                rejected = true;
            }
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, cancelling jobs");
                for id in &ids {
                    orchestrator.cancel(id).await;
                }
                break;
            }
            _ = ticker.tick() => {
                let jobs: Vec<CompressionJob> =
                    ids.iter().filter_map(|id| orchestrator.get_job(id)).collect();
                for job in jobs.iter().filter(|j| j.is_active()) {
                    eprintln!("{}", status_line(job));
                }
                if jobs.iter().all(|j| j.is_terminal()) {
                    break;
                }
            }
        }
    }
    housekeeping.abort();

    let mut all_completed = !rejected;
    for id in &ids {
        if let Some(job) = orchestrator.wait_for(id).await {
            println!("{}", status_line(&job));
            all_completed &= job.status == JobStatus::Completed;
        }
    }

    if all_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn plan(daemon: &Daemon, input: &Path, request: &CompressionRequest) -> ExitCode {
    match daemon.orchestrator.preview(request, input).await {
        Ok((normalized, plan, passes)) => {
            let report = serde_json::json!({
                "request": normalized,
                "plan": plan,
                "passes": passes,
            });
            match serde_json::to_string_pretty(&report) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize plan: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            ExitCode::FAILURE
        }
    }
}

async fn encoders(daemon: &Daemon) -> ExitCode {
    for entry in daemon.orchestrator.discovery().report().await {
        println!(
            "{:<5} {:<18} {}",
            entry.codec.key(),
            entry.encoder.ffmpeg_name(),
            if entry.hardware { "hardware" } else { "software" }
        );
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    // Planning and encoder reports work without a verified ffmpeg install.
    let run_checks = !cli.skip_checks && matches!(cli.command, Command::Compress { .. });
    let daemon = match build_daemon(config, run_checks).await {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match &cli.command {
        Command::Compress { inputs, request } => {
            compress(&daemon, inputs, request.to_request()).await
        }
        Command::Plan { input, request } => plan(&daemon, input, &request.to_request()).await,
        Command::Encoders => encoders(&daemon).await,
    }
}
