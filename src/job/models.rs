use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::parser::ParseResult;

/// Hard ceiling on retained log lines per job.
pub const LOG_CAP: usize = 2000;
/// Number of most recent lines kept when the ceiling is exceeded.
pub const LOG_KEEP: usize = 1500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Job status only moves forward: queued → running → success | failed.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// The five fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ParseConfig,
    PrepareSource,
    PrepareModules,
    RunBuild,
    CollectArtifact,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::ParseConfig,
        Stage::PrepareSource,
        Stage::PrepareModules,
        Stage::RunBuild,
        Stage::CollectArtifact,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ParseConfig => "Parse Config",
            Self::PrepareSource => "Prepare Source",
            Self::PrepareModules => "Prepare Modules",
            Self::RunBuild => "Run Build",
            Self::CollectArtifact => "Collect Artifact",
        }
    }

    pub(crate) fn running_message(&self) -> &'static str {
        match self {
            Self::ParseConfig => "parsing nginx -V output",
            Self::PrepareSource => "downloading nginx source",
            Self::PrepareModules => "syncing modules",
            Self::RunBuild => "running configure",
            Self::CollectArtifact => "collecting nginx binary",
        }
    }

    pub(crate) fn done_message(&self) -> &'static str {
        match self {
            Self::ParseConfig => "configuration parsed",
            Self::PrepareSource => "source ready",
            Self::PrepareModules => "modules ready",
            Self::RunBuild => "build finished",
            Self::CollectArtifact => "artifact ready",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub name: Stage,
    pub status: StepStatus,
    pub message: String,
}

impl Step {
    fn pending(stage: Stage) -> Self {
        Self {
            name: stage,
            status: StepStatus::Pending,
            message: String::new(),
        }
    }
}

/// Bounded, order-preserving job log.
///
/// Once more than [`LOG_CAP`] lines are held, the oldest are dropped so only
/// the latest [`LOG_KEEP`] remain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LogBuffer {
    lines: Vec<String>,
}

impl LogBuffer {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
        if self.lines.len() > LOG_CAP {
            let excess = self.lines.len() - LOG_KEEP;
            self.lines.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// A module supplied directly in a request rather than from the registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomModuleRequest {
    pub name: String,
    pub repo: String,
    /// `add-module` or `add-dynamic-module`; empty means `add-module`.
    #[serde(default)]
    pub flag: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRequest {
    /// Raw `nginx -V` output.
    pub output: String,
    #[serde(default)]
    pub module_names: Vec<String>,
    #[serde(default)]
    pub custom_modules: Vec<CustomModuleRequest>,
    #[serde(default)]
    pub target_version: Option<String>,
}

impl BuildRequest {
    /// The explicit version override, if one was given and is not blank.
    pub fn version_override(&self) -> Option<&str> {
        self.target_version
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// Full lifecycle record of one build request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub steps: [Step; 5],
    pub logs: LogBuffer,
    pub error: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub script: Option<String>,
    pub result: Option<ParseResult>,
    pub request: BuildRequest,
}

impl Job {
    pub fn new(id: impl Into<String>, request: BuildRequest) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            status: JobStatus::Queued,
            steps: Stage::ALL.map(Step::pending),
            logs: LogBuffer::default(),
            error: None,
            artifact_path: None,
            script: None,
            result: None,
            request,
        }
    }

    pub fn step(&self, stage: Stage) -> &Step {
        &self.steps[stage.index()]
    }

    pub fn step_mut(&mut self, stage: Stage) -> &mut Step {
        &mut self.steps[stage.index()]
    }

    /// Apply a status change if it moves forward. Returns whether it was applied.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
