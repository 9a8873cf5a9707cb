//! Maps modules to directories on disk, cloning them when absent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::registry::Module;
use crate::errors::{BuildError, ModuleError};
use crate::job::executor::{JobContext, run_command};
use crate::job::table::JobHandle;

#[derive(Debug)]
pub struct ModuleResolver {
    modules_root: PathBuf,
    git: String,
    // One async lock per target directory so concurrent jobs never clone
    // into the same path at once.
    clone_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModuleResolver {
    pub fn new(modules_root: impl Into<PathBuf>, git: impl Into<String>) -> Self {
        Self {
            modules_root: modules_root.into(),
            git: git.into(),
            clone_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Where `module` lives for a job working in `work_dir`.
    ///
    /// An absolute `path` is used as-is and a relative one is joined under the
    /// modules root. Without a path the module is cloned into
    /// `<work_dir>/modules/<name>`, which requires a repository.
    pub fn resolve_path(&self, module: &Module, work_dir: &Path) -> Result<PathBuf, ModuleError> {
        match &module.path {
            Some(path) if path.is_absolute() => Ok(path.clone()),
            Some(path) => Ok(self.modules_root.join(path)),
            None if module.repository().is_some() => {
                Ok(work_dir.join("modules").join(&module.name))
            }
            None => Err(ModuleError::NoSource(module.name.clone())),
        }
    }

    fn lease(&self, path: &Path) -> CloneLease<'_> {
        let mut locks = self.clone_locks.lock().unwrap_or_else(PoisonError::into_inner);
        let lock = Arc::clone(locks.entry(path.to_path_buf()).or_default());
        CloneLease {
            locks: &self.clone_locks,
            path: path.to_path_buf(),
            lock,
        }
    }

    /// Make sure `module` exists at `path`, shallow-cloning it if needed.
    /// An existing directory is never recloned.
    ///
    /// The clone lands in a sibling `.partial-<job>` directory and is renamed
    /// into place only once git succeeds, so an interrupted clone never
    /// leaves a half-populated module behind.
    pub async fn ensure_present(
        &self,
        module: &Module,
        path: &Path,
        job: &JobHandle,
        ctx: &JobContext,
    ) -> Result<(), BuildError> {
        let lease = self.lease(path);
        let _guard = lease.lock.lock().await;

        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            debug!(module = %module.name, path = %path.display(), "module already present");
            job.append_log(format!("module {} present at {}", module.name, path.display()));
            return Ok(());
        }

        let Some(repo) = module.repository() else {
            return Err(ModuleError::NotProvisioned {
                name: module.name.clone(),
                path: path.to_path_buf(),
            }
            .into());
        };

        let parent = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BuildError::io("failed to create", parent, e))?;

        let staging = partial_path(path, job.id());
        let _ = tokio::fs::remove_dir_all(&staging).await;

        info!(job_id = job.id(), module = %module.name, repo, "cloning module");
        let args = vec![
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            repo.to_string(),
            staging.display().to_string(),
        ];
        if let Err(e) = run_command(ctx, job, parent, &self.git, &args).await {
            discard(&staging).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&staging, path).await {
            discard(&staging).await;
            return Err(BuildError::io("failed to move clone into", path, e));
        }
        Ok(())
    }
}

/// Holds a per-path clone lock and drops the map entry once nobody else
/// is waiting on it.
struct CloneLease<'a> {
    locks: &'a Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    path: PathBuf,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for CloneLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map plus ours means no other lease is live.
        if Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.path)
                .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock))
        {
            locks.remove(&self.path);
        }
    }
}

fn partial_path(path: &Path, job_id: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".partial-{}", job_id));
    path.with_file_name(name)
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(staging).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %staging.display(), error = %e, "failed to remove partial clone");
    }
}
