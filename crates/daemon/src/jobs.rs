//! Job records and their persistence.
//!
//! A [`CompressionJob`] carries everything needed to report on a compression
//! and to retry it later: the original request, the source path, the plan
//! and the encoder used. Stores persist records as they change; the engine
//! does not care whether a store is durable.

use crate::encode::catalog::EncoderId;
use crate::planner::CompressionPlan;
use crate::request::{Codec, CompressionRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot.
    #[default]
    Queued,
    /// An encoder process is running for the job.
    Processing,
    Completed,
    /// Planning, probing or encoding failed; see the error message.
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A compression job and its current state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompressionJob {
    /// Unique job identifier (UUID).
    pub id: String,
    /// File name of the source as submitted.
    pub original_filename: String,
    pub source_path: PathBuf,
    /// The request as submitted, reused verbatim on retry.
    pub request: CompressionRequest,
    pub codec: Codec,
    pub status: JobStatus,
    pub plan: Option<CompressionPlan>,
    /// Encoder actually used.
    pub encoder: Option<EncoderId>,
    /// Overall progress, 0 to 100.
    pub progress: f64,
    pub eta_secs: Option<f64>,
    /// Jobs ahead of this one; only set while queued.
    #[serde(default)]
    pub queue_position: Option<usize>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub output_size_bytes: Option<u64>,
    /// Number of lifecycles started, 1 for a job never retried.
    pub attempts: u32,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the job was last updated.
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl CompressionJob {
    /// A fresh Queued job with a new UUID.
    pub fn new(source_path: &Path, request: CompressionRequest, codec: Codec) -> Self {
        let now = current_timestamp_ms();
        let original_filename = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id: Uuid::new_v4().to_string(),
            original_filename,
            source_path: source_path.to_path_buf(),
            request,
            codec,
            status: JobStatus::Queued,
            plan: None,
            encoder: None,
            progress: 0.0,
            eta_secs: None,
            queue_position: None,
            error: None,
            output_path: None,
            output_size_bytes: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Move to Processing.
    pub fn start(&mut self) {
        self.status = JobStatus::Processing;
        self.queue_position = None;
        self.started_at = Some(current_timestamp_ms());
        self.touch();
    }

    /// Record progress. Progress never moves backwards within a lifecycle.
    pub fn set_progress(&mut self, percent: f64, eta_secs: Option<f64>) {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.progress = self.progress.max(percent);
        self.eta_secs = eta_secs;
        self.touch();
    }

    /// Mark the job as completed with its output.
    pub fn complete(&mut self, output_path: PathBuf, output_size_bytes: u64) {
        self.status = JobStatus::Completed;
        self.progress = 100.0;
        self.eta_secs = None;
        self.output_path = Some(output_path);
        self.output_size_bytes = Some(output_size_bytes);
        self.finish();
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Failed;
        self.error = Some(reason.to_string());
        self.eta_secs = None;
        self.finish();
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.eta_secs = None;
        self.output_size_bytes = None;
        self.finish();
    }

    fn finish(&mut self) {
        self.queue_position = None;
        self.finished_at = Some(current_timestamp_ms());
        self.touch();
    }

    /// Start a fresh Queued lifecycle reusing the original request.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Queued;
        self.progress = 0.0;
        self.eta_secs = None;
        self.error = None;
        self.plan = None;
        self.encoder = None;
        self.output_path = None;
        self.output_size_bytes = None;
        self.started_at = None;
        self.finished_at = None;
        self.attempts += 1;
        self.touch();
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job is active (queued or processing).
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Processing)
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Persistence surface for job records.
pub trait JobStore: Send + Sync {
    fn save(&self, job: &CompressionJob) -> Result<(), io::Error>;
    fn load(&self, id: &str) -> Result<Option<CompressionJob>, io::Error>;
    fn list(&self) -> Result<Vec<CompressionJob>, io::Error>;
    /// Delete a record. Removing an unknown id is not an error.
    fn remove(&self, id: &str) -> Result<(), io::Error>;
}

/// One pretty-printed `{id}.json` per job in a state directory.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    state_dir: PathBuf,
}

impl JsonDirStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }
}

/// Loads a single job from a JSON file.
fn load_job_from_file(path: &Path) -> Result<CompressionJob, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl JobStore for JsonDirStore {
    /// Written to a temp file and renamed, so readers never see a torn record.
    fn save(&self, job: &CompressionJob) -> Result<(), io::Error> {
        fs::create_dir_all(&self.state_dir)?;

        let json = serde_json::to_string_pretty(job)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.state_dir.join(format!("{}.json.tmp", job.id));
        fs::write(&tmp, json)?;
        fs::rename(tmp, self.path_for(&job.id))
    }

    fn load(&self, id: &str) -> Result<Option<CompressionJob>, io::Error> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        load_job_from_file(&path).map(Some)
    }

    /// Unparseable files are skipped with a warning.
    fn list(&self) -> Result<Vec<CompressionJob>, io::Error> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.state_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_job_from_file(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job record"),
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    fn remove(&self, id: &str) -> Result<(), io::Error> {
        match fs::remove_file(self.path_for(id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Non-durable store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, CompressionJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryStore {
    fn save(&self, job: &CompressionJob) -> Result<(), io::Error> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<CompressionJob>, io::Error> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<CompressionJob>, io::Error> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<CompressionJob> = jobs.values().cloned().collect();
        all.sort_by_key(|j| j.created_at);
        Ok(all)
    }

    fn remove(&self, id: &str) -> Result<(), io::Error> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(id);
        Ok(())
    }
}
