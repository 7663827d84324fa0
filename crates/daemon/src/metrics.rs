//! Metrics for Smart Compressor
//!
//! Per-job and system metrics, aggregated into a snapshot that the
//! orchestrator keeps current and the metrics endpoint serves as JSON.

use crate::jobs::{current_timestamp_ms, CompressionJob, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics tracking compression progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub original_filename: String,
    pub status: JobStatus,
    pub codec: String,
    pub encoder: Option<String>,
    pub progress: f64,
    pub eta_secs: Option<f64>,
    pub queue_position: Option<usize>,
    pub video_bitrate_kbps: Option<u32>,
    pub scale_percent: Option<u32>,
    pub passes: Option<u8>,
    pub target_size_mb: Option<f64>,
    pub size_in_bytes_after: Option<u64>,
}

impl JobMetrics {
    pub fn from_job(job: &CompressionJob) -> Self {
        Self {
            id: job.id.clone(),
            original_filename: job.original_filename.clone(),
            status: job.status,
            codec: job.codec.to_string(),
            encoder: job.encoder.map(|e| e.to_string()),
            progress: job.progress,
            eta_secs: job.eta_secs,
            queue_position: job.queue_position,
            video_bitrate_kbps: job.plan.as_ref().map(|p| p.video_bitrate_kbps),
            scale_percent: job.plan.as_ref().map(|p| p.scale_percent),
            passes: job.plan.as_ref().map(|p| p.passes),
            target_size_mb: job.request.target_size_mb,
            size_in_bytes_after: job.output_size_bytes,
        }
    }
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub total_bytes_encoded: u64,
}

impl MetricsSnapshot {
    /// Aggregate a snapshot from the current job table.
    pub fn from_jobs<'a>(
        jobs: impl IntoIterator<Item = &'a CompressionJob>,
        system: SystemMetrics,
    ) -> Self {
        let mut snapshot = MetricsSnapshot {
            timestamp_unix_ms: current_timestamp_ms(),
            system,
            ..MetricsSnapshot::default()
        };

        for job in jobs {
            match job.status {
                JobStatus::Queued => snapshot.queue_len += 1,
                JobStatus::Processing => snapshot.running_jobs += 1,
                JobStatus::Completed => {
                    snapshot.completed_jobs += 1;
                    snapshot.total_bytes_encoded += job.output_size_bytes.unwrap_or(0);
                }
                JobStatus::Failed => snapshot.failed_jobs += 1,
                JobStatus::Cancelled => snapshot.cancelled_jobs += 1,
            }
            snapshot.jobs.push(JobMetrics::from_job(job));
        }
        snapshot
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
