//! Typed error hierarchy for the build service.
//!
//! Top-level enums per subsystem:
//! - `ParseError`: the `nginx -V` dump could not be understood
//! - `ValidationError`: a build request was rejected before a job existed
//! - `ModuleError`: preset lookup and custom module checks
//! - `CommandError`: a subprocess could not finish cleanly
//! - `BuildError`: any failure inside a pipeline stage
//! - `QueueError`: the queue no longer accepts work
//! - `HistoryError`, `RegistryError`, `ConfigError`: startup and persistence failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from parsing a captured `nginx -V` dump.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("could not find the nginx version; the output must contain an `nginx version:` line")]
    MissingVersion,

    #[error("could not find configure arguments; the output must contain a `configure arguments:` line")]
    MissingConfigureArguments,
}

/// Errors from validating a build request before it is queued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("nginx -V output must not be empty")]
    EmptyOutput,

    #[error("invalid target version '{0}', expected a dotted version such as 1.24.0")]
    InvalidVersion(String),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

/// Errors from module lookup, validation and resolution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("module {0} is not in the preset registry")]
    UnknownPreset(String),

    #[error("module name must not be empty")]
    EmptyName,

    #[error("module name '{0}' may only contain letters, digits, dots, underscores and hyphens")]
    InvalidName(String),

    #[error("repository for module {0} must not be empty")]
    EmptyRepository(String),

    #[error("repository '{0}' must use https://")]
    InsecureRepository(String),

    #[error("module flag '{0}' must be add-module or add-dynamic-module")]
    InvalidFlag(String),

    #[error("module {0} has neither a local path nor a repository and must be pre-provisioned")]
    NoSource(String),

    #[error("module {name} was not found at {} and must be pre-provisioned", .path.display())]
    NotProvisioned { name: String, path: PathBuf },
}

/// Why a running subprocess was stopped before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Errors from running one external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}", describe_exit(.code))]
    Exited { program: String, code: Option<i32> },

    #[error("{program} exceeded the build time limit and was terminated")]
    TimedOut { program: String },

    #[error("{program} was cancelled")]
    Cancelled { program: String },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl CommandError {
    pub fn interrupted(program: &str, reason: Interrupt) -> Self {
        match reason {
            Interrupt::TimedOut => Self::TimedOut {
                program: program.to_string(),
            },
            Interrupt::Cancelled => Self::Cancelled {
                program: program.to_string(),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Errors from a single pipeline stage. The `Display` text is what the job
/// and its failing step report.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Errors from submitting work to the build queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("build queue is shut down")]
    Closed,
}

/// Errors from the history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to read history file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history file {} is malformed: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write history file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize history: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("history lock poisoned")]
    LockPoisoned,

    #[error("history write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors from loading the module registry document.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read module registry {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("module registry is malformed: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Errors from loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid build_timeout '{value}': {source}")]
    Timeout {
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}
