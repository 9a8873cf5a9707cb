//! Shared job map and the per-job write handle used by workers.
//!
//! One coarse lock guards every job. Writers take it only for the duration of
//! a single field update, never across an `.await`, so pollers calling
//! [`JobTable::get`] are never held up by a running subprocess.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use super::models::{Job, JobStatus, Stage, StepStatus};
use crate::parser::ParseResult;

#[derive(Debug, Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock can only interrupt a single field
    // assignment, so the map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, job: Job) {
        self.write().insert(job.id.clone(), job);
    }

    pub fn remove(&self, id: &str) -> Option<Job> {
        self.write().remove(id)
    }

    /// Snapshot of the job as it is right now.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.read().get(id).cloned()
    }

    /// Mutate a job in place. Returns `None` if the id is unknown.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.write().get_mut(id).map(f)
    }
}

/// Write access to one job, handed to the worker that owns it and to the
/// stream readers of its subprocesses.
#[derive(Debug, Clone)]
pub struct JobHandle {
    table: Arc<JobTable>,
    id: Arc<str>,
}

impl JobHandle {
    pub fn new(table: Arc<JobTable>, id: &str) -> Self {
        Self {
            table,
            id: Arc::from(id),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Option<Job> {
        self.table.get(&self.id)
    }

    pub fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        self.table.update(&self.id, |job| job.logs.push(line));
    }

    pub fn set_step(&self, stage: Stage, status: StepStatus, message: impl Into<String>) {
        let message = message.into();
        self.table.update(&self.id, |job| {
            let step = job.step_mut(stage);
            step.status = status;
            step.message = message;
        });
    }

    /// Move the job forward. Backward or sideways transitions are dropped.
    pub fn set_status(&self, status: JobStatus) -> bool {
        let applied = self
            .table
            .update(&self.id, |job| {
                let from = job.status;
                (job.advance(status), from)
            });
        match applied {
            Some((true, _)) => true,
            Some((false, from)) => {
                warn!(job_id = %self.id, %from, to = %status, "ignoring invalid status transition");
                false
            }
            None => false,
        }
    }

    /// Mark the job failed with `error` and return the resulting snapshot.
    pub fn fail(&self, error: impl Into<String>) -> Option<Job> {
        let error = error.into();
        self.table.update(&self.id, |job| {
            job.advance(JobStatus::Failed);
            job.error = Some(error);
            job.clone()
        })
    }

    pub fn set_result(&self, result: ParseResult) {
        self.table.update(&self.id, |job| job.result = Some(result));
    }

    pub fn set_script(&self, script: impl Into<String>) {
        let script = script.into();
        self.table.update(&self.id, |job| job.script = Some(script));
    }

    pub fn set_artifact(&self, path: PathBuf) {
        self.table.update(&self.id, |job| job.artifact_path = Some(path));
    }
}
