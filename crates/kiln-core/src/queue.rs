//! Admission queue for sandbox builds.
//!
//! Builds are expensive, so at most `max_concurrent` run at once. Jobs are
//! started in submission order; each job invokes the [`BuildHandler`]
//! exactly once and is never retried. [`AdmissionQueue::run_inline`] is the
//! synchronous path and calls the same handler without queueing.

use crate::error::{CoreError, Result};
use crate::lifecycle::LifecycleController;
use crate::sandbox::{CreateSandboxRequest, Sandbox, SandboxId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Semaphore};
use uuid::Uuid;

pub type JobId = Uuid;

/// Builds one sandbox.
#[async_trait]
pub trait BuildHandler: Send + Sync {
    async fn build(&self, id: SandboxId, request: CreateSandboxRequest) -> Result<Sandbox>;
}

#[async_trait]
impl BuildHandler for LifecycleController {
    async fn build(&self, id: SandboxId, request: CreateSandboxRequest) -> Result<Sandbox> {
        self.create_with_id(id, request).await
    }
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Error recorded on a job cancelled before it started.
pub const CANCELLED: &str = "Cancelled";

/// One queued build and its outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub request: CreateSandboxRequest,
    /// Id the sandbox is built under, known from submission on.
    pub sandbox_id: SandboxId,
    pub result: Option<Sandbox>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn new(request: CreateSandboxRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            request,
            sandbox_id: SandboxId::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// Configuration and statistics
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Builds allowed to run at the same time.
    pub max_concurrent: usize,
    /// How long finished jobs stay visible before [`AdmissionQueue::cleanup`]
    /// evicts them.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            retention: Duration::from_secs(3600),
        }
    }
}

/// Snapshot of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_concurrent: usize,
    /// Handler invocations since start, including evicted jobs.
    pub processed: u64,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    pending: VecDeque<JobId>,
    waiters: HashMap<JobId, Vec<oneshot::Sender<Job>>>,
}

impl QueueState {
    /// Store a terminal job and hand it to everyone waiting for it.
    fn finish(&mut self, job: Job) {
        for waiter in self.waiters.remove(&job.id).unwrap_or_default() {
            // A waiter that timed out has dropped its receiver
            let _ = waiter.send(job.clone());
        }
        self.jobs.insert(job.id, job);
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Bounded-concurrency queue in front of a [`BuildHandler`].
pub struct AdmissionQueue {
    handler: Arc<dyn BuildHandler>,
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
    permits: Arc<Semaphore>,
    processed: Arc<AtomicU64>,
}

impl AdmissionQueue {
    pub fn new(handler: Arc<dyn BuildHandler>, config: QueueConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        tracing::info!(max_concurrent, "Creating admission queue");
        Self {
            handler,
            config: QueueConfig {
                max_concurrent,
                ..config
            },
            state: Arc::new(Mutex::new(QueueState::default())),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit a build and return the job in `queued` state.
    pub async fn enqueue(&self, request: CreateSandboxRequest) -> Job {
        let job = Job::new(request);
        {
            let mut state = self.state.lock().await;
            state.pending.push_back(job.id);
            state.jobs.insert(job.id, job.clone());
            tracing::info!(job_id = %job.id, sandbox_id = %job.sandbox_id, queued = state.pending.len(), "Job queued");
        }

        let state = Arc::clone(&self.state);
        let permits = Arc::clone(&self.permits);
        let handler = Arc::clone(&self.handler);
        let processed = Arc::clone(&self.processed);
        tokio::spawn(async move {
            // Fails only once the queue is shut down.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            Self::run_next(state, handler, processed).await;
        });

        job
    }

    /// Start the oldest pending job, if any. Cancelled jobs leave the pending
    /// list, so a worker may find nothing to do.
    async fn run_next(state: Arc<Mutex<QueueState>>, handler: Arc<dyn BuildHandler>, processed: Arc<AtomicU64>) {
        let (id, sandbox_id, request) = {
            let mut guard = state.lock().await;
            let Some(id) = guard.pending.pop_front() else {
                return;
            };
            let Some(job) = guard.jobs.get_mut(&id) else {
                return;
            };
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            (id, job.sandbox_id, job.request.clone())
        };
        tracing::info!(job_id = %id, sandbox_id = %sandbox_id, "Job started");

        let start = std::time::Instant::now();
        let outcome = handler.build(sandbox_id, request).await;
        processed.fetch_add(1, Ordering::Relaxed);

        let mut guard = state.lock().await;
        let Some(mut job) = guard.jobs.remove(&id) else {
            return;
        };
        job.completed_at = Some(Utc::now());
        match outcome {
            Ok(sandbox) => {
                job.status = JobStatus::Completed;
                job.result = Some(sandbox);
                tracing::info!(job_id = %id, elapsed_ms = start.elapsed().as_millis() as u64, "Job completed");
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.to_string());
                tracing::error!(job_id = %id, error = %e, "Job failed");
            }
        }
        guard.finish(job);
    }

    /// Submit a build and wait for its outcome.
    ///
    /// # Errors
    ///
    /// `Timeout` when the job is not finished within `timeout`. A job still
    /// queued at that point is cancelled; one already running is left to
    /// finish and can still be looked up.
    pub async fn enqueue_and_wait(&self, request: CreateSandboxRequest, timeout: Duration) -> Result<Job> {
        let job = self.enqueue(request).await;
        match self.wait(job.id, timeout).await {
            Err(CoreError::Timeout(elapsed)) => {
                match self.cancel(job.id).await {
                    Ok(_) => tracing::warn!(job_id = %job.id, "Job cancelled after wait timed out"),
                    Err(e) => tracing::debug!(job_id = %job.id, error = %e, "Timed out job keeps running"),
                }
                Err(CoreError::Timeout(elapsed))
            }
            other => other,
        }
    }

    /// Wait until `id` reaches a terminal state.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> Result<Job> {
        let rx = {
            let mut state = self.state.lock().await;
            match state.jobs.get(&id) {
                None => return Err(CoreError::not_found("job", id)),
                Some(job) if job.status.is_terminal() => return Ok(job.clone()),
                Some(_) => {}
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(id).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(_)) => Err(CoreError::not_found("job", id)),
            Err(_) => Err(CoreError::Timeout(timeout)),
        }
    }

    /// Build synchronously, bypassing the queue.
    pub async fn run_inline(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        self.run_inline_with_id(SandboxId::new(), request).await
    }

    pub async fn run_inline_with_id(&self, id: SandboxId, request: CreateSandboxRequest) -> Result<Sandbox> {
        let outcome = self.handler.build(id, request).await;
        self.processed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Cancel a job that has not started yet. It ends up `failed` with the
    /// error [`CANCELLED`].
    pub async fn cancel(&self, id: JobId) -> Result<Job> {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.jobs.remove(&id) else {
            return Err(CoreError::not_found("job", id));
        };
        if job.status != JobStatus::Queued {
            let actual = format!("{:?}", job.status).to_lowercase();
            state.jobs.insert(id, job);
            return Err(CoreError::InvalidState {
                expected: "queued".into(),
                actual,
            });
        }

        state.pending.retain(|pending| *pending != id);
        job.status = JobStatus::Failed;
        job.error = Some(CANCELLED.into());
        job.completed_at = Some(Utc::now());
        tracing::info!(job_id = %id, "Job cancelled");
        state.finish(job.clone());
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    async fn jobs_with(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs waiting for a worker, oldest first.
    pub async fn queued_jobs(&self) -> Vec<Job> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub async fn running_jobs(&self) -> Vec<Job> {
        self.jobs_with(JobStatus::Running).await
    }

    /// The `limit` most recently submitted jobs, newest first.
    pub async fn recent_jobs(&self, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            max_concurrent: self.config.max_concurrent,
            processed: self.processed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Evict finished jobs older than the retention window. Returns how many
    /// were removed.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let retention = self.config.retention;
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| match job.completed_at {
            Some(done) if job.status.is_terminal() => (now - done)
                .to_std()
                .map(|age| age < retention)
                .unwrap_or(true),
            _ => true,
        });
        let removed = before - state.jobs.len();
        if removed > 0 {
            tracing::debug!(removed, "Evicted finished jobs");
        }
        removed
    }

    /// Stop starting new jobs and fail everything still queued. Running
    /// builds are left to finish.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut state = self.state.lock().await;
        let pending: Vec<JobId> = state.pending.drain(..).collect();
        for id in &pending {
            if let Some(mut job) = state.jobs.remove(id) {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.error = Some("queue shut down".into());
                state.finish(job);
            }
        }
        tracing::info!(cancelled = pending.len(), "Admission queue shut down");
    }
}
