//! Concurrency planning
//!
//! Sizes the admission gate (how many encodes run at once) and the thread
//! budget handed to each software encode, from the CPU core count and
//! configuration.

use crate::config::Config;

/// Admission gate size when the configuration does not set one.
pub const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 2;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Maximum number of simultaneously Processing jobs
    pub max_concurrent_jobs: u32,
    /// Encoder threads per job (`-threads`)
    pub threads_per_job: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Explicit non-zero job and thread settings win
    /// - Otherwise 2 concurrent jobs sharing the target threads evenly
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .filter(|&c| c > 0)
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = (((total_cores as f32) * clamped_utilization).round() as u32).max(1);

        let max_concurrent_jobs = if cfg.jobs.max_concurrent_jobs > 0 {
            cfg.jobs.max_concurrent_jobs
        } else {
            DEFAULT_MAX_CONCURRENT_JOBS
        };

        let threads_per_job = if cfg.jobs.threads_per_job > 0 {
            cfg.jobs.threads_per_job
        } else {
            (target_threads / max_concurrent_jobs).max(1)
        };

        Self {
            total_cores,
            target_threads,
            max_concurrent_jobs,
            threads_per_job,
        }
    }
}

/// Clamp utilization to valid range [0.5, 1.0]; NaN falls back to the floor.
fn clamp_utilization(util: f32) -> f32 {
    if util.is_nan() {
        0.5
    } else {
        util.clamp(0.5, 1.0)
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
