//! Job orchestrator for Smart Compressor
//!
//! Owns the job table, the FIFO queue and the admission gate. Submissions are
//! planned up front so invalid requests are rejected before anything runs;
//! admitted jobs run their encoder passes on their own task, feed progress
//! back into the job record, and finish as Completed, Failed or Cancelled.
//!
//! Each job lives in its own slot guarded by a mutex. Locks are never held
//! across an await, so progress callbacks and status readers only contend on
//! the one job they touch.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::catalog::CatalogError;
use crate::encode::command::{build_all_passes, EncodeInvocation};
use crate::encode::discovery::EncoderDiscovery;
use crate::encode::strategy::CodecStrategy;
use crate::jobs::{CompressionJob, JobStatus, JobStore};
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::planner::{self, CompressionPlan, PlanningError};
use crate::probe::MetadataProbe;
use crate::progress::ProgressParser;
use crate::request::{normalize, Codec, CompressionRequest, NormalizedRequest};
use crate::runner::{EncoderRunner, RunError, RunOutcome};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error recorded on jobs that were active when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// Why a submission was rejected.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// Missing tuning entry for a supported codec and mode.
    #[error("encoder configuration error: {0}")]
    Configuration(#[from] CatalogError),

    #[error("failed to persist job: {0}")]
    Store(#[from] io::Error),
}

/// Why a retry was refused.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {id} is {status} and cannot be retried")]
    NotRetryable { id: String, status: JobStatus },

    #[error(transparent)]
    Prepare(#[from] SubmitError),
}

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Outputs and pass logs are written here.
    pub work_dir: PathBuf,
    /// Size of the admission gate.
    pub max_concurrent_jobs: usize,
    /// `-threads` for software encodes.
    pub threads_per_job: Option<usize>,
    /// How long outputs of Failed/Cancelled jobs are kept before sweeping.
    pub failed_retention: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            work_dir: cfg.paths.work_dir.clone(),
            max_concurrent_jobs: plan.max_concurrent_jobs.max(1) as usize,
            threads_per_job: Some(plan.threads_per_job as usize),
            failed_retention: Duration::from_secs(cfg.jobs.failed_retention_secs),
        }
    }
}

/// External capabilities the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn MetadataProbe>,
    pub runner: Arc<dyn EncoderRunner>,
    pub store: Arc<dyn JobStore>,
    pub discovery: Arc<EncoderDiscovery>,
}

struct SlotState {
    job: CompressionJob,
    /// Submission order of the current lifecycle.
    seq: u64,
    cancel: CancellationToken,
    /// Cancelled once the current lifecycle reaches a terminal state.
    finished: CancellationToken,
    /// Dropped from the job table by the retention sweep.
    evicted: bool,
}

struct JobSlot {
    state: Mutex<SlotState>,
}

impl JobSlot {
    fn new(job: CompressionJob, seq: u64) -> Self {
        let finished = CancellationToken::new();
        if job.is_terminal() {
            finished.cancel();
        }
        Self {
            state: Mutex::new(SlotState {
                job,
                seq,
                cancel: CancellationToken::new(),
                finished,
                evicted: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> CompressionJob {
        self.lock().job.clone()
    }

    /// Move a still-queued lifecycle to Processing.
    fn try_start(&self, seq: u64) -> bool {
        let mut state = self.lock();
        if state.seq != seq || state.job.status != JobStatus::Queued || state.cancel.is_cancelled() {
            return false;
        }
        state.job.start();
        true
    }
}

/// A planned request, ready to become a job.
struct Prepared {
    codec: Codec,
    normalized: NormalizedRequest,
    plan: CompressionPlan,
    strategy: CodecStrategy,
}

/// How an admitted job ended, short of success.
enum ExecError {
    Cancelled,
    Failed(String),
}

/// Removes rate-control statistics files sharing a prefix when dropped.
struct PassLogGuard {
    prefix: PathBuf,
}

impl Drop for PassLogGuard {
    fn drop(&mut self) {
        let removed = remove_pass_logs(&self.prefix);
        if removed > 0 {
            debug!(prefix = %self.prefix.display(), removed, "removed pass logs");
        }
    }
}

/// Delete every file in the prefix's directory whose name starts with the
/// prefix's file name. Returns the number of files removed.
pub fn remove_pass_logs(prefix: &Path) -> usize {
    let (Some(dir), Some(stem)) = (prefix.parent(), prefix.file_name()) else {
        return 0;
    };
    let stem = stem.to_string_lossy();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(stem.as_ref()))
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}

fn describe_exit(outcome: &RunOutcome) -> String {
    let status = match outcome.exit_code {
        Some(code) => format!("encoder exited with code {}", code),
        None => "encoder was terminated by a signal".to_string(),
    };
    let tail = outcome.stderr_tail.trim();
    if tail.is_empty() {
        status
    } else {
        format!("{}: {}", status, tail)
    }
}

struct Inner {
    settings: OrchestratorSettings,
    probe: Arc<dyn MetadataProbe>,
    runner: Arc<dyn EncoderRunner>,
    store: Arc<dyn JobStore>,
    discovery: Arc<EncoderDiscovery>,
    metrics: SharedMetrics,
    jobs: RwLock<HashMap<String, Arc<JobSlot>>>,
    next_seq: AtomicU64,
    queue_tx: mpsc::UnboundedSender<(Arc<JobSlot>, u64)>,
}

impl Inner {
    fn slot(&self, id: &str) -> Option<Arc<JobSlot>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn persist(&self, job: &CompressionJob) {
        if let Err(e) = self.store.save(job) {
            warn!(job_id = %job.id, error = %e, "failed to persist job");
        }
    }

    fn enqueue(&self, slot: Arc<JobSlot>, seq: u64) {
        if self.queue_tx.send((slot, seq)).is_err() {
            error!("job queue dispatcher has stopped");
        }
    }

    /// Output file for a job. Stream copies keep the source container.
    fn output_path(&self, id: &str, plan: &CompressionPlan, source: &Path) -> PathBuf {
        let extension = if plan.skip_compression {
            source
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_else(|| plan.extension.clone())
        } else {
            plan.extension.clone()
        };
        self.settings.work_dir.join(format!("{}.{}", id, extension))
    }

    fn pass_log_prefix(&self, id: &str) -> PathBuf {
        self.settings.work_dir.join(format!("{}-passlog", id))
    }

    fn build_passes(
        &self,
        id: &str,
        plan: &CompressionPlan,
        strategy: &CodecStrategy,
        source: &Path,
    ) -> Result<Vec<Vec<String>>, CatalogError> {
        let output = self.output_path(id, plan, source);
        let pass_log_prefix = self.pass_log_prefix(id);
        build_all_passes(&EncodeInvocation {
            input: source,
            output: &output,
            plan,
            strategy,
            threads: self.settings.threads_per_job,
            pass_log_prefix: &pass_log_prefix,
        })
    }

    /// Normalize, probe, pick the encoder and plan.
    async fn prepare(
        &self,
        request: &CompressionRequest,
        source: &Path,
    ) -> Result<Prepared, SubmitError> {
        let codec: Codec = request.codec.parse()?;
        let metadata = self
            .probe
            .probe(source)
            .await
            .map_err(PlanningError::from)?;
        let normalized = normalize(request, metadata.duration_secs)?;
        let strategy = CodecStrategy::discover(codec, &self.discovery).await;
        let plan = planner::plan(&normalized, &strategy.planning_context(), &metadata)?;

        Ok(Prepared {
            codec,
            normalized,
            plan,
            strategy,
        })
    }

    fn job_with_position(&self, slot: &JobSlot) -> CompressionJob {
        let mut job = slot.snapshot();
        job.queue_position = self.position_of(slot);
        job
    }

    fn position_of(&self, slot: &JobSlot) -> Option<usize> {
        let seq = {
            let state = slot.lock();
            if state.job.status != JobStatus::Queued {
                return None;
            }
            state.seq
        };
        let ahead = self
            .slots()
            .iter()
            .filter(|other| {
                let state = other.lock();
                state.job.status == JobStatus::Queued && state.seq < seq
            })
            .count();
        Some(ahead)
    }

    fn list_jobs(&self) -> Vec<CompressionJob> {
        let mut jobs: Vec<CompressionJob> = self
            .slots()
            .iter()
            .map(|slot| self.job_with_position(slot))
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    async fn refresh_metrics(&self) {
        let jobs = self.list_jobs();
        let mut snapshot = self.metrics.write().await;
        let system = snapshot.system.clone();
        *snapshot = MetricsSnapshot::from_jobs(&jobs, system);
    }

    /// Apply a terminal transition, persist it and wake waiters.
    async fn finalize(&self, slot: &JobSlot, apply: impl FnOnce(&mut CompressionJob)) {
        let (job, finished) = {
            let mut state = slot.lock();
            apply(&mut state.job);
            (state.job.clone(), state.finished.clone())
        };
        self.persist(&job);
        self.refresh_metrics().await;
        finished.cancel();
    }

    /// Run an admitted job to a terminal state.
    async fn run_job(&self, slot: Arc<JobSlot>) {
        let (job, cancel) = {
            let state = slot.lock();
            (state.job.clone(), state.cancel.clone())
        };
        self.persist(&job);
        self.refresh_metrics().await;
        info!(
            job_id = %job.id,
            codec = %job.codec,
            encoder = ?job.encoder.map(|e| e.ffmpeg_name()),
            attempt = job.attempts,
            "job started"
        );

        let output = job
            .plan
            .as_ref()
            .map(|plan| self.output_path(&job.id, plan, &job.source_path));

        match self.execute(&slot, &job, &cancel).await {
            Ok(size) => {
                info!(job_id = %job.id, output_bytes = size, "job completed");
                let output = output.unwrap_or_default();
                self.finalize(&slot, |j| j.complete(output, size)).await;
            }
            Err(ExecError::Cancelled) => {
                if let Some(path) = &output {
                    if let Err(e) = tokio::fs::remove_file(path).await {
                        if e.kind() != io::ErrorKind::NotFound {
                            warn!(job_id = %job.id, error = %e, "failed to remove cancelled output");
                        }
                    }
                }
                info!(job_id = %job.id, "job cancelled");
                self.finalize(&slot, |j| j.cancel()).await;
            }
            Err(ExecError::Failed(reason)) => {
                warn!(job_id = %job.id, reason = %reason, "job failed");
                // Partial output stays for inspection until the retention sweep.
                let partial = match &output {
                    Some(path) if tokio::fs::try_exists(path).await.unwrap_or(false) => {
                        Some(path.clone())
                    }
                    _ => None,
                };
                self.finalize(&slot, |j| {
                    j.fail(&reason);
                    j.output_path = partial;
                })
                .await;
            }
        }
    }

    /// Run every pass. Returns the output size on success.
    async fn execute(
        &self,
        slot: &Arc<JobSlot>,
        job: &CompressionJob,
        cancel: &CancellationToken,
    ) -> Result<u64, ExecError> {
        let plan = job
            .plan
            .as_ref()
            .ok_or_else(|| ExecError::Failed("job has no plan".to_string()))?;
        let encoder = job
            .encoder
            .ok_or_else(|| ExecError::Failed("job has no encoder".to_string()))?;
        let strategy = CodecStrategy::with_encoder(job.codec, encoder)
            .map_err(|e| ExecError::Failed(e.to_string()))?;

        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| ExecError::Failed(format!("cannot create work directory: {}", e)))?;

        let _pass_logs = PassLogGuard {
            prefix: self.pass_log_prefix(&job.id),
        };
        let passes = self
            .build_passes(&job.id, plan, &strategy, &job.source_path)
            .map_err(|e| ExecError::Failed(e.to_string()))?;
        let pass_count = passes.len() as u8;

        for (index, args) in passes.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecError::Cancelled);
            }

            let pass = index as u8 + 1;
            debug!(job_id = %job.id, pass, passes = pass_count, args = ?args, "running encoder pass");

            let mut parser = ProgressParser::for_pass(plan.kept_duration_secs, pass, pass_count);
            let mut on_line = |line: &str| {
                if parser.feed(line) {
                    slot.lock()
                        .job
                        .set_progress(parser.overall_percent(), parser.overall_eta_secs());
                }
            };

            match self.runner.run(args, &mut on_line, cancel).await {
                Ok(outcome) if outcome.success() => {}
                Ok(_) if cancel.is_cancelled() => return Err(ExecError::Cancelled),
                Ok(outcome) => return Err(ExecError::Failed(describe_exit(&outcome))),
                Err(RunError::Cancelled) => return Err(ExecError::Cancelled),
                Err(e) => return Err(ExecError::Failed(e.to_string())),
            }
        }

        let output = self.output_path(&job.id, plan, &job.source_path);
        tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .map_err(|e| ExecError::Failed(format!("encoder produced no output: {}", e)))
    }
}

/// Pulls queued jobs in FIFO order and admits them through the gate.
///
/// Holds only a weak reference so the queue shuts down with the orchestrator.
async fn dispatch(
    inner: Weak<Inner>,
    mut queue: mpsc::UnboundedReceiver<(Arc<JobSlot>, u64)>,
    gate: Arc<Semaphore>,
) {
    while let Some((slot, seq)) = queue.recv().await {
        {
            let state = slot.lock();
            if state.seq != seq || state.job.status != JobStatus::Queued {
                continue;
            }
        }

        let Ok(permit) = gate.clone().acquire_owned().await else {
            break;
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !slot.try_start(seq) {
            continue;
        }

        tokio::spawn(async move {
            let _permit = permit;
            inner.run_job(slot).await;
        });
    }
    debug!("job dispatcher stopped");
}

/// The orchestration surface: submit, inspect, cancel and retry jobs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator and start its dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: OrchestratorSettings,
        collaborators: Collaborators,
        metrics: SharedMetrics,
    ) -> Self {
        let gate = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            settings,
            probe: collaborators.probe,
            runner: collaborators.runner,
            store: collaborators.store,
            discovery: collaborators.discovery,
            metrics,
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            queue_tx,
        });

        tokio::spawn(dispatch(Arc::downgrade(&inner), queue_rx, gate));

        Self { inner }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn discovery(&self) -> &EncoderDiscovery {
        &self.inner.discovery
    }

    /// Load persisted jobs. Jobs that were Queued or Processing when the
    /// previous process stopped become Failed so they can be retried.
    pub async fn restore(&self) -> io::Result<usize> {
        let jobs = self.inner.store.list()?;
        let mut restored = 0;
        for mut job in jobs {
            if job.is_active() {
                warn!(job_id = %job.id, status = %job.status, "marking interrupted job as failed");
                job.fail(INTERRUPTED_MESSAGE);
                self.inner.persist(&job);
            }

            let mut table = self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if !table.contains_key(&job.id) {
                table.insert(job.id.clone(), Arc::new(JobSlot::new(job, 0)));
                restored += 1;
            }
        }
        self.inner.refresh_metrics().await;
        info!(restored, "restored persisted jobs");
        Ok(restored)
    }

    /// Validate, plan and enqueue a compression. Returns the job id.
    pub async fn submit(
        &self,
        request: CompressionRequest,
        source_path: &Path,
    ) -> Result<String, SubmitError> {
        let prepared = self.inner.prepare(&request, source_path).await?;

        let mut job = CompressionJob::new(source_path, request, prepared.codec);
        self.inner
            .build_passes(&job.id, &prepared.plan, &prepared.strategy, source_path)?;
        job.encoder = Some(prepared.strategy.video_encoder());
        job.plan = Some(prepared.plan);
        self.inner.store.save(&job)?;

        let id = job.id.clone();
        let seq = self.inner.next_seq();
        let slot = Arc::new(JobSlot::new(job, seq));
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), slot.clone());
        self.inner.enqueue(slot, seq);
        self.inner.refresh_metrics().await;

        info!(
            job_id = %id,
            source = %source_path.display(),
            codec = %prepared.codec,
            encoder = %prepared.strategy.video_encoder(),
            "job submitted"
        );
        Ok(id)
    }

    /// Plan a request and build its encoder arguments without enqueuing.
    pub async fn preview(
        &self,
        request: &CompressionRequest,
        source_path: &Path,
    ) -> Result<(NormalizedRequest, CompressionPlan, Vec<Vec<String>>), SubmitError> {
        let prepared = self.inner.prepare(request, source_path).await?;
        let passes =
            self.inner
                .build_passes("preview", &prepared.plan, &prepared.strategy, source_path)?;
        Ok((prepared.normalized, prepared.plan, passes))
    }

    /// Current state of a job, with its queue position filled in.
    pub fn get_job(&self, id: &str) -> Option<CompressionJob> {
        let slot = self.inner.slot(id)?;
        Some(self.inner.job_with_position(&slot))
    }

    /// Every known job, oldest first.
    pub fn list_jobs(&self) -> Vec<CompressionJob> {
        self.inner.list_jobs()
    }

    /// Jobs queued ahead of this one that are still waiting, or None when
    /// the job is not queued.
    pub fn queue_position(&self, id: &str) -> Option<usize> {
        let slot = self.inner.slot(id)?;
        self.inner.position_of(&slot)
    }

    /// Wait until the job's current lifecycle ends and return its record.
    pub async fn wait_for(&self, id: &str) -> Option<CompressionJob> {
        let slot = self.inner.slot(id)?;
        let finished = slot.lock().finished.clone();
        finished.cancelled().await;
        Some(slot.snapshot())
    }

    /// Cancel a queued or processing job.
    ///
    /// For a processing job this returns once the encoder process is gone and
    /// the job is finalized. Returns false for unknown or finished jobs.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some(slot) = self.inner.slot(id) else {
            return false;
        };

        let (status, finished) = {
            let mut state = slot.lock();
            let status = state.job.status;
            match status {
                JobStatus::Queued => {
                    state.cancel.cancel();
                    state.job.cancel();
                }
                JobStatus::Processing => state.cancel.cancel(),
                _ => return false,
            }
            (status, state.finished.clone())
        };

        if status == JobStatus::Queued {
            info!(job_id = %id, "queued job cancelled");
            self.inner.persist(&slot.snapshot());
            self.inner.refresh_metrics().await;
            finished.cancel();
            return true;
        }

        finished.cancelled().await;
        let cancelled = slot.lock().job.status == JobStatus::Cancelled;
        cancelled
    }

    /// Cancel every queued and processing job. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let active: Vec<String> = self
            .list_jobs()
            .into_iter()
            .filter(|job| job.is_active())
            .map(|job| job.id)
            .collect();

        let mut cancelled = 0;
        for id in active {
            if self.cancel(&id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Start a fresh lifecycle for a Failed or Cancelled job, reusing its
    /// original request. The request is planned again against the source.
    pub async fn retry(&self, id: &str) -> Result<(), RetryError> {
        let slot = self
            .inner
            .slot(id)
            .ok_or_else(|| RetryError::NotFound(id.to_string()))?;

        let (request, source, status) = {
            let state = slot.lock();
            (
                state.job.request.clone(),
                state.job.source_path.clone(),
                state.job.status,
            )
        };
        if !matches!(status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(RetryError::NotRetryable {
                id: id.to_string(),
                status,
            });
        }

        let prepared = self.inner.prepare(&request, &source).await?;
        self.inner
            .build_passes(id, &prepared.plan, &prepared.strategy, &source)
            .map_err(SubmitError::from)?;

        let seq = self.inner.next_seq();
        let job = {
            let mut state = slot.lock();
            if state.evicted {
                return Err(RetryError::NotFound(id.to_string()));
            }
            if !state.job.can_retry() {
                return Err(RetryError::NotRetryable {
                    id: id.to_string(),
                    status: state.job.status,
                });
            }
            state.job.reset_for_retry();
            state.job.codec = prepared.codec;
            state.job.encoder = Some(prepared.strategy.video_encoder());
            state.job.plan = Some(prepared.plan);
            state.seq = seq;
            state.cancel = CancellationToken::new();
            state.finished = CancellationToken::new();
            state.job.clone()
        };

        self.inner.store.save(&job).map_err(SubmitError::from)?;
        self.inner.enqueue(slot, seq);
        self.inner.refresh_metrics().await;
        info!(job_id = %id, attempt = job.attempts, "job requeued");
        Ok(())
    }

    /// Evict terminal jobs that finished at least the retention period
    /// before `now_ms`, dropping them from the job table and the store.
    ///
    /// Outputs of Failed/Cancelled jobs are deleted with them. A Completed
    /// job's output belongs to the caller and stays. Returns the number of
    /// files removed.
    pub async fn sweep_expired(&self, now_ms: i64) -> usize {
        let retention_ms = self.inner.settings.failed_retention.as_millis() as i64;

        let evicted: Vec<CompressionJob> = {
            let mut table = self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let mut evicted = Vec::new();
            table.retain(|_, slot| {
                let mut state = slot.lock();
                let due = state.job.is_terminal()
                    && state
                        .job
                        .finished_at
                        .is_some_and(|finished| now_ms.saturating_sub(finished) >= retention_ms);
                if due {
                    state.evicted = true;
                    evicted.push(state.job.clone());
                }
                !due
            });
            evicted
        };
        if evicted.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for job in &evicted {
            let output = job
                .output_path
                .as_ref()
                .filter(|_| job.status != JobStatus::Completed);
            if let Some(path) = output {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(job_id = %job.id, path = %path.display(), error = %e, "sweep failed"),
                }
            }
            if let Err(e) = self.inner.store.remove(&job.id) {
                warn!(job_id = %job.id, error = %e, "failed to delete job record");
            }
        }

        self.inner.refresh_metrics().await;
        info!(evicted = evicted.len(), removed, "swept expired jobs");
        removed
    }

    /// Rebuild the shared metrics snapshot from the job table.
    pub async fn refresh_metrics(&self) {
        self.inner.refresh_metrics().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::catalog::EncoderId;
    use crate::encode::command::null_device;
    use crate::jobs::MemoryStore;
    use crate::metrics::new_shared_metrics;
    use crate::probe::{ProbeError, SourceMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI32;
    use tempfile::TempDir;

    const EARLY_LINE: &str =
        "frame=  900 fps= 60 q=28.0 size=     512kB time=00:00:30.00 bitrate= 139.8kbits/s speed=2.00x";
    const LAST_LINE: &str =
        "frame= 3600 fps= 60 q=28.0 size=    2048kB time=00:02:00.00 bitrate= 139.8kbits/s speed=2.00x";

    struct FakeProbe;

    #[async_trait]
    impl MetadataProbe for FakeProbe {
        async fn probe(&self, path: &Path) -> Result<SourceMetadata, ProbeError> {
            if path.to_string_lossy().contains("missing") {
                return Err(ProbeError::FfprobeFailed("No such file".to_string()));
            }
            Ok(SourceMetadata {
                width: 1920,
                height: 1080,
                duration_secs: 120.0,
                has_audio: true,
                frame_rate: Some(30.0),
                size_bytes: 50 * 1024 * 1024,
                video_codec: Some("h264".to_string()),
            })
        }
    }

    /// Emits ffmpeg-like progress, writes the output file and optionally
    /// blocks until released or cancelled.
    #[derive(Default)]
    struct FakeRunner {
        exit_code: AtomicI32,
        hold: Option<Arc<Semaphore>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeRunner {
        fn holding() -> (Self, Arc<Semaphore>) {
            let hold = Arc::new(Semaphore::new(0));
            let runner = FakeRunner {
                hold: Some(hold.clone()),
                ..FakeRunner::default()
            };
            (runner, hold)
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EncoderRunner for FakeRunner {
        async fn run(
            &self,
            args: &[String],
            on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
            cancel: &CancellationToken,
        ) -> Result<RunOutcome, RunError> {
            if cancel.is_cancelled() {
                return Err(RunError::Cancelled);
            }
            self.calls.lock().unwrap().push(args.to_vec());

            let output = args.last().cloned().unwrap_or_default();
            let writes_output = output != null_device();
            if let Some(i) = args.iter().position(|a| a == "-passlogfile") {
                std::fs::write(format!("{}-0.log", args[i + 1]), b"stats").unwrap();
            }

            on_line(EARLY_LINE);
            if writes_output {
                std::fs::write(&output, b"partial").unwrap();
            }

            if let Some(hold) = &self.hold {
                tokio::select! {
                    permit = hold.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    _ = cancel.cancelled() => return Err(RunError::Cancelled),
                }
            }

            let code = self.exit_code.load(Ordering::SeqCst);
            if code == 0 && writes_output {
                std::fs::write(&output, b"encoded output").unwrap();
                on_line(LAST_LINE);
            }
            Ok(RunOutcome {
                exit_code: Some(code),
                stderr_tail: if code == 0 {
                    String::new()
                } else {
                    "Conversion failed: boom".to_string()
                },
            })
        }
    }

    struct Harness {
        orch: Orchestrator,
        runner: Arc<FakeRunner>,
        store: Arc<MemoryStore>,
        source: PathBuf,
        work_dir: PathBuf,
        _dir: TempDir,
    }

    fn harness_with_store(runner: FakeRunner, max_jobs: usize, store: Arc<MemoryStore>) -> Harness {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("clip.mp4");
        std::fs::write(&source, b"source").unwrap();
        let work_dir = dir.path().join("work");

        let runner = Arc::new(runner);
        let settings = OrchestratorSettings {
            work_dir: work_dir.clone(),
            max_concurrent_jobs: max_jobs,
            threads_per_job: Some(4),
            failed_retention: Duration::from_secs(60),
        };
        let orch = Orchestrator::new(
            settings,
            Collaborators {
                probe: Arc::new(FakeProbe),
                runner: runner.clone(),
                store: store.clone(),
                discovery: Arc::new(EncoderDiscovery::software_only()),
            },
            new_shared_metrics(),
        );

        Harness {
            orch,
            runner,
            store,
            source,
            work_dir,
            _dir: dir,
        }
    }

    fn harness(runner: FakeRunner, max_jobs: usize) -> Harness {
        harness_with_store(runner, max_jobs, Arc::new(MemoryStore::new()))
    }

    fn request() -> CompressionRequest {
        CompressionRequest::new("h264").with_target_size_mb(8.0)
    }

    async fn wait_for_status(orch: &Orchestrator, id: &str, status: JobStatus) -> CompressionJob {
        for _ in 0..500 {
            if let Some(job) = orch.get_job(id) {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    fn work_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_two_pass_job_completes() {
        let h = harness(FakeRunner::default(), 2);
        let id = h.orch.submit(request(), &h.source).await.unwrap();

        let job = h.orch.wait_for(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);
        assert_eq!(job.encoder, Some(EncoderId::Libx264));
        assert_eq!(job.output_size_bytes, Some(14));
        assert_eq!(job.queue_position, None);

        let output = job.output_path.clone().unwrap();
        assert_eq!(output, h.work_dir.join(format!("{}.mp4", id)));
        assert_eq!(std::fs::read(&output).unwrap(), b"encoded output");

        let calls = h.runner.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].windows(2).any(|w| w[0] == "-pass" && w[1] == "1"));
        assert_eq!(calls[0].last().map(String::as_str), Some(null_device()));
        assert!(calls[1].windows(2).any(|w| w[0] == "-pass" && w[1] == "2"));
        assert!(calls[1].windows(2).any(|w| w[0] == "-threads" && w[1] == "4"));

        // Only the output remains; pass logs were cleaned up.
        assert_eq!(work_files(&h.work_dir), vec![format!("{}.mp4", id)]);

        let stored = h.store.load(&id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let snapshot = h.orch.inner.metrics.read().await.clone();
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.total_bytes_encoded, 14);
    }

    #[tokio::test]
    async fn test_rejects_invalid_requests_before_queueing() {
        let h = harness(FakeRunner::default(), 2);

        let err = h
            .orch
            .submit(CompressionRequest::new("mpeg2"), &h.source)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Planning(PlanningError::UnknownCodec(_))));

        let err = h
            .orch
            .submit(request(), Path::new("/uploads/missing.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Planning(PlanningError::Probe(_))));

        let err = h
            .orch
            .submit(CompressionRequest::new("h264").with_target_size_mb(0.0), &h.source)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Planning(PlanningError::InvalidTargetSize(_))
        ));

        assert!(h.orch.list_jobs().is_empty());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_encoder_failure_then_retry() {
        let h = harness(FakeRunner::default(), 2);
        h.runner.exit_code.store(1, Ordering::SeqCst);

        let id = h.orch.submit(request(), &h.source).await.unwrap();
        let failed = h.orch.wait_for(&id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        let error = failed.error.unwrap();
        assert!(error.contains("code 1"), "{}", error);
        assert!(error.contains("boom"), "{}", error);
        assert!(remove_pass_logs(&h.work_dir.join(format!("{}-passlog", id))) == 0);

        h.runner.exit_code.store(0, Ordering::SeqCst);
        h.orch.retry(&id).await.unwrap();
        let job = wait_for_status(&h.orch, &id, JobStatus::Completed).await;
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error, None);
        assert_eq!(job.progress, 100.0);
    }

    #[tokio::test]
    async fn test_retry_rules() {
        let h = harness(FakeRunner::default(), 2);
        assert!(matches!(
            h.orch.retry("nope").await,
            Err(RetryError::NotFound(_))
        ));

        let id = h.orch.submit(request(), &h.source).await.unwrap();
        h.orch.wait_for(&id).await.unwrap();
        assert!(matches!(
            h.orch.retry(&id).await,
            Err(RetryError::NotRetryable {
                status: JobStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_processing_job_removes_output() {
        let (runner, _hold) = FakeRunner::holding();
        let h = harness(runner, 2);

        let id = h.orch.submit(request(), &h.source).await.unwrap();
        wait_for_status(&h.orch, &id, JobStatus::Processing).await;

        assert!(h.orch.cancel(&id).await);
        let job = h.orch.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error, None);
        assert!(work_files(&h.work_dir).is_empty());

        // Already terminal.
        assert!(!h.orch.cancel(&id).await);
        assert!(!h.orch.cancel("unknown").await);
    }

    #[tokio::test]
    async fn test_gate_and_fifo_queue_positions() {
        let (runner, hold) = FakeRunner::holding();
        let h = harness(runner, 1);

        let first = h.orch.submit(request(), &h.source).await.unwrap();
        let second = h.orch.submit(request(), &h.source).await.unwrap();
        let third = h.orch.submit(request(), &h.source).await.unwrap();

        wait_for_status(&h.orch, &first, JobStatus::Processing).await;
        assert_eq!(h.orch.queue_position(&first), None);
        assert_eq!(h.orch.queue_position(&second), Some(0));
        assert_eq!(h.orch.queue_position(&third), Some(1));
        assert_eq!(h.orch.get_job(&third).unwrap().queue_position, Some(1));

        assert!(h.orch.cancel(&second).await);
        assert_eq!(h.orch.get_job(&second).unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.orch.queue_position(&third), Some(0));

        // A retried job re-enters the queue behind everything still waiting.
        h.orch.retry(&second).await.unwrap();
        let requeued = h.orch.get_job(&second).unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.progress, 0.0);
        assert_eq!(requeued.error, None);
        assert_eq!(requeued.queue_position, Some(1));

        hold.add_permits(100);
        for id in [&first, &third, &second] {
            let job = h.orch.wait_for(id).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_restore_marks_interrupted_jobs_failed() {
        let store = Arc::new(MemoryStore::new());
        let mut interrupted = CompressionJob::new(Path::new("/in/a.mp4"), request(), Codec::H264);
        interrupted.start();
        let mut done = CompressionJob::new(Path::new("/in/b.mp4"), request(), Codec::H264);
        done.complete(PathBuf::from("/out/b.mp4"), 10);
        store.save(&interrupted).unwrap();
        store.save(&done).unwrap();

        let h = harness_with_store(FakeRunner::default(), 2, store);
        assert_eq!(h.orch.restore().await.unwrap(), 2);

        let job = h.orch.wait_for(&interrupted.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(
            h.store.load(&interrupted.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(h.orch.get_job(&done.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_jobs() {
        let store = Arc::new(MemoryStore::new());
        let dir = TempDir::new().unwrap();
        let leftover = dir.path().join("partial.mp4");
        let delivered = dir.path().join("done.mp4");
        std::fs::write(&leftover, b"partial").unwrap();
        std::fs::write(&delivered, b"encoded output").unwrap();

        let mut failed = CompressionJob::new(Path::new("/in/a.mp4"), request(), Codec::H264);
        failed.fail("encoder exited with code 1");
        failed.output_path = Some(leftover.clone());
        let finished_at = failed.finished_at.unwrap();
        let mut done = CompressionJob::new(Path::new("/in/b.mp4"), request(), Codec::H264);
        done.complete(delivered.clone(), 14);
        done.finished_at = Some(finished_at);
        store.save(&failed).unwrap();
        store.save(&done).unwrap();

        let h = harness_with_store(FakeRunner::default(), 2, store);
        h.orch.restore().await.unwrap();

        assert_eq!(h.orch.sweep_expired(finished_at + 59_000).await, 0);
        assert!(leftover.exists());
        assert_eq!(h.orch.list_jobs().len(), 2);

        assert_eq!(h.orch.sweep_expired(finished_at + 60_000).await, 1);
        assert!(!leftover.exists());
        assert!(delivered.exists());
        assert!(h.orch.get_job(&failed.id).is_none());
        assert!(h.orch.get_job(&done.id).is_none());
        assert_eq!(h.store.load(&failed.id).unwrap(), None);
        assert!(h.store.list().unwrap().is_empty());
        assert!(matches!(
            h.orch.retry(&failed.id).await,
            Err(RetryError::NotFound(_))
        ));
        assert_eq!(h.orch.inner.metrics.read().await.jobs.len(), 0);

        assert_eq!(h.orch.sweep_expired(finished_at + 120_000).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_jobs() {
        let (runner, hold) = FakeRunner::holding();
        let h = harness(runner, 1);
        let running = h.orch.submit(request(), &h.source).await.unwrap();
        let waiting = h.orch.submit(request(), &h.source).await.unwrap();
        wait_for_status(&h.orch, &running, JobStatus::Processing).await;

        assert_eq!(h.orch.sweep_expired(i64::MAX).await, 0);
        assert_eq!(h.orch.list_jobs().len(), 2);

        hold.add_permits(100);
        for id in [&running, &waiting] {
            assert_eq!(h.orch.wait_for(id).await.unwrap().status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_preview_does_not_enqueue() {
        let h = harness(FakeRunner::default(), 2);
        let (normalized, plan, passes) = h.orch.preview(&request(), &h.source).await.unwrap();

        assert_eq!(normalized.codec, Codec::H264);
        assert_eq!(plan.passes, 2);
        assert_eq!(passes.len(), 2);
        assert!(passes[1].last().unwrap().ends_with("preview.mp4"));
        assert!(h.orch.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_copy_plan_keeps_source_container() {
        let h = harness(FakeRunner::default(), 2);
        let request = CompressionRequest::new("av1").with_target_size_mb(100.0);
        let (_, plan, passes) = h.orch.preview(&request, &h.source).await.unwrap();

        assert!(plan.skip_compression);
        assert_eq!(passes.len(), 1);
        assert!(passes[0].contains(&"copy".to_string()));
        assert!(passes[0].last().unwrap().ends_with("preview.mp4"));
    }

    #[tokio::test]
    async fn test_copy_of_matroska_source_skips_faststart() {
        let h = harness(FakeRunner::default(), 2);
        let source = h.work_dir.with_file_name("clip.mkv");
        std::fs::write(&source, b"source").unwrap();
        let request = CompressionRequest::new("h264").with_target_size_mb(100.0);
        let (_, plan, passes) = h.orch.preview(&request, &source).await.unwrap();

        assert!(plan.skip_compression);
        assert!(passes[0].last().unwrap().ends_with("preview.mkv"));
        assert!(!passes[0].iter().any(|a| a == "-movflags"));
    }

    #[test]
    fn test_remove_pass_logs_matches_prefix_only() {
        let dir = TempDir::new().unwrap();
        for name in ["job-passlog-0.log", "job-passlog-0.log.mbtree", "job.mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        assert_eq!(remove_pass_logs(&dir.path().join("job-passlog")), 2);
        assert_eq!(work_files(dir.path()), vec!["job.mp4".to_string()]);
    }
}
