//! Subprocess execution for pipeline stages.
//!
//! Each command gets two reader tasks, one per output stream, that forward
//! lines into the owning job's log as they arrive. Both readers are joined
//! before the exit status is inspected. A [`JobContext`] bounds the whole
//! call: when its deadline passes or it is cancelled, the child is killed.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::table::JobHandle;
use crate::errors::{CommandError, Interrupt};

/// Per-job cancellation and deadline.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl JobContext {
    /// Derive a job context from the engine's root token. A `None` or zero
    /// timeout means the job has no deadline.
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            deadline: timeout
                .filter(|t| !t.is_zero())
                .map(|t| Instant::now() + t),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// If the context is already done, why.
    pub fn expired(&self) -> Option<Interrupt> {
        if self.token.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn interrupted(&self) -> Interrupt {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Interrupt::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Interrupt::TimedOut,
            },
            None => {
                self.token.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }
}

enum Finished {
    Exited(std::io::Result<ExitStatus>),
    Interrupted(Interrupt),
}

/// Run `program args...` in `dir`, streaming its output into `job`'s log.
pub async fn run_command(
    ctx: &JobContext,
    job: &JobHandle,
    dir: &Path,
    program: &str,
    args: &[String],
) -> Result<(), CommandError> {
    if let Some(reason) = ctx.expired() {
        return Err(CommandError::interrupted(program, reason));
    }

    debug!(job_id = job.id(), program, ?args, dir = %dir.display(), "spawning command");
    job.append_log(format!("$ {} {}", program, args.join(" ")));

    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let mut readers = JoinSet::new();
    if let Some(stdout) = child.stdout.take() {
        readers.spawn(forward_lines(stdout, job.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.spawn(forward_lines(stderr, job.clone()));
    }

    let finished = tokio::select! {
        status = async {
            while readers.join_next().await.is_some() {}
            child.wait().await
        } => Finished::Exited(status),
        reason = ctx.interrupted() => Finished::Interrupted(reason),
    };

    match finished {
        Finished::Exited(Ok(status)) if status.success() => Ok(()),
        Finished::Exited(Ok(status)) => Err(CommandError::Exited {
            program: program.to_string(),
            code: status.code(),
        }),
        Finished::Exited(Err(source)) => Err(CommandError::Wait {
            program: program.to_string(),
            source,
        }),
        Finished::Interrupted(reason) => {
            warn!(job_id = job.id(), program, ?reason, "terminating command");
            if let Err(e) = child.kill().await {
                warn!(job_id = job.id(), program, error = %e, "failed to kill command");
            }
            // Grandchildren may still hold the pipes open.
            readers.abort_all();
            while readers.join_next().await.is_some() {}
            Err(CommandError::interrupted(program, reason))
        }
    }
}

async fn forward_lines<R>(stream: R, job: JobHandle)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut segments = BufReader::new(stream).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                job.append_log(line.trim_end_matches('\r'));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(job_id = job.id(), error = %e, "output stream closed with error");
                break;
            }
        }
    }
}
