//! Capped, disk-backed record of finished builds.
//!
//! The whole list is rewritten on every append. Entries are kept newest
//! first and never exceed [`HISTORY_CAP`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{Job, JobStatus};
use crate::errors::HistoryError;

pub const HISTORY_CAP: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub modules: Vec<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    /// Entry for a job that produced `artifact`. Carries the job's id,
    /// creation time and requested preset modules.
    pub fn success(job: &Job, version: &str, artifact: PathBuf) -> Self {
        Self {
            id: job.id.clone(),
            created_at: job.created_at,
            version: version.to_string(),
            modules: job.request.module_names.clone(),
            status: JobStatus::Success,
            artifact: Some(artifact),
            error: None,
        }
    }

    pub fn failure(job: &Job, version: &str, error: &str) -> Self {
        Self {
            id: job.id.clone(),
            created_at: job.created_at,
            version: version.to_string(),
            modules: job.request.module_names.clone(),
            status: JobStatus::Failed,
            artifact: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryStore {
    /// Load the history file at `path`. A missing or empty file yields an
    /// empty history; unparseable content is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                HistoryError::Malformed {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(HistoryError::Read { path, source }),
        };
        debug!(path = %path.display(), entries = entries.len(), "loaded build history");
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<HistoryEntry>>, HistoryError> {
        self.entries.lock().map_err(|_| HistoryError::LockPoisoned)
    }

    /// Copy of all entries, newest first.
    pub fn list(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(self.lock()?.clone())
    }

    pub fn find(&self, id: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self.lock()?.iter().find(|e| e.id == id).cloned())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `entry` as the newest and rewrite the backing file.
    pub fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.lock()?;
        entries.insert(0, entry);
        entries.truncate(HISTORY_CAP);
        match &self.path {
            Some(path) => persist(path, &entries),
            None => Ok(()),
        }
    }

    /// `append` on the blocking pool, so the file rewrite never stalls a
    /// runtime worker.
    pub async fn append_async(self: Arc<Self>, entry: HistoryEntry) -> Result<(), HistoryError> {
        tokio::task::spawn_blocking(move || self.append(entry)).await?
    }
}

// Write to a sibling temp file and rename so readers never see a torn document.
fn persist(path: &Path, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
    let write_err = |source| HistoryError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let json = serde_json::to_string_pretty(entries).map_err(HistoryError::Serialize)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)
}
