//! Bounded build queue and its fixed worker pool.
//!
//! `submit` reserves a slot on a bounded channel, waiting when the channel is
//! full, then registers the job and pushes its id. Each worker takes one id at a time, runs the
//! pipeline under a per-job deadline and records the outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::JobContext;
use super::history::{HistoryEntry, HistoryStore};
use super::models::{BuildRequest, Job, JobStatus};
use super::pipeline::BuildPipeline;
use super::table::{JobHandle, JobTable};
use crate::errors::{HistoryError, QueueError, ValidationError};
use crate::modules::registry::validate_custom_module;
use crate::parser::is_valid_version;

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    /// Whole-job time limit. `None` means no deadline.
    pub timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 100,
            timeout: None,
        }
    }
}

/// State shared by the queue front end and every worker.
struct Shared {
    jobs: Arc<JobTable>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<String>>,
    pipeline: BuildPipeline,
    history: Arc<HistoryStore>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

pub struct BuildQueue {
    shared: Arc<Shared>,
    sender: mpsc::Sender<String>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildQueue {
    /// Spawn the worker pool on the current tokio runtime.
    pub fn start(config: QueueConfig, pipeline: BuildPipeline, history: Arc<HistoryStore>) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let shared = Arc::new(Shared {
            jobs: Arc::new(JobTable::new()),
            receiver: tokio::sync::Mutex::new(receiver),
            pipeline,
            history,
            timeout: config.timeout,
            shutdown: CancellationToken::new(),
        });

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(worker_loop(index, Arc::clone(&shared))))
            .collect();

        info!(
            workers = config.workers.max(1),
            capacity = config.capacity.max(1),
            timeout = ?config.timeout,
            "build queue started"
        );
        Self {
            shared,
            sender,
            workers: Mutex::new(workers),
        }
    }

    /// Reject a request before any job exists for it.
    pub fn validate(&self, request: &BuildRequest) -> Result<(), ValidationError> {
        validate_request(request)
    }

    /// Register a job for `request` and enqueue it, waiting while the queue
    /// is full. Returns the job as first registered, before any work starts.
    ///
    /// The slot is reserved before the job is registered, so a caller that
    /// gives up while waiting leaves no orphaned job behind.
    pub async fn submit(&self, request: BuildRequest) -> Result<Job, QueueError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let permit = tokio::select! {
            permit = self.sender.reserve() => permit.map_err(|_| QueueError::Closed)?,
            _ = self.shared.shutdown.cancelled() => return Err(QueueError::Closed),
        };

        let job = Job::new(new_job_id(), request);
        self.shared.jobs.insert(job.clone());
        permit.send(job.id.clone());

        debug!(job_id = %job.id, "job queued");
        Ok(job)
    }

    /// Snapshot of a job. Never waits on running builds.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.shared.jobs.get(id)
    }

    pub fn list_history(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.shared.history.list()
    }

    pub fn find_history(&self, id: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        self.shared.history.find(id)
    }

    /// Stop accepting work, terminate running builds and wait for the
    /// workers to exit.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let workers: Vec<_> = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "build worker ended abnormally");
            }
        }
        info!("build queue stopped");
    }
}

/// Checks that need nothing but the request itself: non-empty `nginx -V`
/// output, a well-formed version override and valid custom modules.
pub fn validate_request(request: &BuildRequest) -> Result<(), ValidationError> {
    if request.output.trim().is_empty() {
        return Err(ValidationError::EmptyOutput);
    }
    if let Some(version) = request.version_override()
        && !is_valid_version(version)
    {
        return Err(ValidationError::InvalidVersion(version.to_string()));
    }
    for custom in &request.custom_modules {
        validate_custom_module(&custom.name, &custom.repo, &custom.flag)?;
    }
    Ok(())
}

/// 24 hex characters drawn from a random v4 UUID.
fn new_job_id() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..12])
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!(worker = index, "build worker started");
    loop {
        let next = {
            let mut receiver = shared.receiver.lock().await;
            tokio::select! {
                _ = shared.shutdown.cancelled() => None,
                id = receiver.recv() => id,
            }
        };
        let Some(id) = next else { break };
        shared.process(&id).await;
    }
    debug!(worker = index, "build worker stopped");
}

impl Shared {
    async fn process(&self, id: &str) {
        let handle = JobHandle::new(Arc::clone(&self.jobs), id);
        let Some(job) = handle.snapshot() else {
            warn!(job_id = id, "queued job disappeared before it ran");
            return;
        };
        if !handle.set_status(JobStatus::Running) {
            return;
        }

        info!(job_id = id, "build started");
        let ctx = JobContext::new(&self.shutdown, self.timeout);
        let result = self.pipeline.run(&handle, &job.request, &ctx).await;
        ctx.cancel();

        match result {
            Ok(()) => {
                handle.set_status(JobStatus::Success);
                info!(job_id = id, "build succeeded");
            }
            Err(e) => {
                let message = e.to_string();
                error!(job_id = id, error = %message, "build failed");
                let Some(failed) = handle.fail(message.as_str()) else {
                    return;
                };
                // Without a parsed version there is nothing meaningful to record.
                if let Some(parsed) = &failed.result {
                    let entry = HistoryEntry::failure(&failed, &parsed.version, &message);
                    if let Err(e) = Arc::clone(&self.history).append_async(entry).await {
                        warn!(job_id = id, error = %e, "failed to record build history");
                    }
                }
            }
        }
    }
}
