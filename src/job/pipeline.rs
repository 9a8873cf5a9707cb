//! The five-stage build pipeline.
//!
//! Stages run strictly in order. The first failing stage records its error on
//! its step and aborts the run; later steps are left pending.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::executor::{JobContext, run_command};
use super::history::{HistoryEntry, HistoryStore};
use super::models::{BuildRequest, Stage, StepStatus};
use super::table::JobHandle;
use crate::config::Toolchain;
use crate::errors::{BuildError, ModuleError};
use crate::modules::registry::{Module, ModuleRegistry, validate_custom_module};
use crate::modules::resolver::ModuleResolver;
use crate::parser::{ParseResult, parse_nginx_v};

/// Filesystem roots and external programs used by every build.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_root: PathBuf,
    pub modules_root: PathBuf,
    /// Base URL the `nginx-<version>.tar.gz` archives are fetched from.
    pub source_url: String,
    pub toolchain: Toolchain,
}

#[derive(Debug)]
pub struct BuildPipeline {
    work_root: PathBuf,
    source_url: String,
    toolchain: Toolchain,
    registry: Arc<ModuleRegistry>,
    resolver: ModuleResolver,
    history: Arc<HistoryStore>,
}

impl BuildPipeline {
    pub fn new(
        settings: PipelineSettings,
        registry: Arc<ModuleRegistry>,
        history: Arc<HistoryStore>,
    ) -> Self {
        let resolver = ModuleResolver::new(settings.modules_root, settings.toolchain.git.clone());
        Self {
            work_root: settings.work_root,
            source_url: settings.source_url.trim_end_matches('/').to_string(),
            toolchain: settings.toolchain,
            registry,
            resolver,
            history,
        }
    }

    pub fn work_dir(&self, job_id: &str) -> PathBuf {
        self.work_root.join(job_id)
    }

    /// Run every stage for `job`. On success the artifact path is set on the
    /// job and a success entry is appended to the history.
    pub async fn run(
        &self,
        job: &JobHandle,
        request: &BuildRequest,
        ctx: &JobContext,
    ) -> Result<(), BuildError> {
        let parsed = run_stage(job, Stage::ParseConfig, async {
            let mut parsed = parse_nginx_v(&request.output)?;
            if let Some(version) = request.version_override() {
                parsed.version = version.to_string();
            }
            Ok::<_, BuildError>(parsed)
        })
        .await?;
        job.set_result(parsed.clone());
        let version = parsed.version.as_str();

        let work_dir = self.work_dir(job.id());
        let src_dir = work_dir.join(format!("nginx-{}", version));

        run_stage(job, Stage::PrepareSource, self.prepare_source(job, ctx, &work_dir, version)).await?;

        let module_args = run_stage(
            job,
            Stage::PrepareModules,
            self.prepare_modules(job, ctx, request, &work_dir),
        )
        .await?;

        run_stage(
            job,
            Stage::RunBuild,
            self.run_build(job, ctx, &parsed, &module_args, &work_dir, &src_dir),
        )
        .await?;

        let artifact = run_stage(
            job,
            Stage::CollectArtifact,
            collect_artifact(job, &work_dir, &src_dir, version),
        )
        .await?;

        if let Some(snapshot) = job.snapshot() {
            let entry = HistoryEntry::success(&snapshot, version, artifact);
            if let Err(e) = Arc::clone(&self.history).append_async(entry).await {
                warn!(job_id = job.id(), error = %e, "failed to record build history");
            }
        }
        Ok(())
    }

    async fn prepare_source(
        &self,
        job: &JobHandle,
        ctx: &JobContext,
        work_dir: &Path,
        version: &str,
    ) -> Result<(), BuildError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| BuildError::io("failed to create", work_dir, e))?;

        let tarball = work_dir.join(format!("nginx-{}.tar.gz", version));
        let url = format!("{}/nginx-{}.tar.gz", self.source_url, version);
        run_command(
            ctx,
            job,
            work_dir,
            &self.toolchain.curl,
            &["-fSL".to_string(), url, "-o".to_string(), tarball.display().to_string()],
        )
        .await?;

        run_command(
            ctx,
            job,
            work_dir,
            &self.toolchain.tar,
            &["-xzf".to_string(), tarball.display().to_string()],
        )
        .await?;
        Ok(())
    }

    /// Resolve presets then custom modules, returning one configure flag per
    /// module in that order.
    async fn prepare_modules(
        &self,
        job: &JobHandle,
        ctx: &JobContext,
        request: &BuildRequest,
        work_dir: &Path,
    ) -> Result<Vec<String>, BuildError> {
        let mut args = Vec::with_capacity(request.module_names.len() + request.custom_modules.len());

        for name in &request.module_names {
            let module = self
                .registry
                .get(name)
                .ok_or_else(|| ModuleError::UnknownPreset(name.clone()))?;
            args.push(self.provision(job, ctx, module, work_dir).await?);
        }

        for custom in &request.custom_modules {
            let module = validate_custom_module(&custom.name, &custom.repo, &custom.flag)?;
            args.push(self.provision(job, ctx, &module, work_dir).await?);
        }
        Ok(args)
    }

    async fn provision(
        &self,
        job: &JobHandle,
        ctx: &JobContext,
        module: &Module,
        work_dir: &Path,
    ) -> Result<String, BuildError> {
        let path = self.resolver.resolve_path(module, work_dir)?;
        self.resolver.ensure_present(module, &path, job, ctx).await?;
        Ok(format!("{}={}", module.flag.as_arg(), path.display()))
    }

    async fn run_build(
        &self,
        job: &JobHandle,
        ctx: &JobContext,
        parsed: &ParseResult,
        module_args: &[String],
        work_dir: &Path,
        src_dir: &Path,
    ) -> Result<(), BuildError> {
        let configure_args = compose_configure_args(&parsed.arguments, module_args);

        let script = build_script(&self.source_url, &parsed.version, &configure_args);
        let script_path = work_dir.join("build.sh");
        tokio::fs::write(&script_path, &script)
            .await
            .map_err(|e| BuildError::io("failed to write", &script_path, e))?;
        job.set_script(script);

        let configure = src_dir.join("configure");
        run_command(ctx, job, src_dir, &configure.display().to_string(), &configure_args).await?;

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        job.append_log(format!("configure finished, running make with {} jobs", jobs));
        job.set_step(Stage::RunBuild, StepStatus::Running, "compiling");
        run_command(
            ctx,
            job,
            src_dir,
            &self.toolchain.make,
            &["-j".to_string(), jobs.to_string()],
        )
        .await?;
        Ok(())
    }
}

/// Drive one stage, mirroring its progress onto the job's step.
async fn run_stage<T, F>(job: &JobHandle, stage: Stage, work: F) -> Result<T, BuildError>
where
    F: Future<Output = Result<T, BuildError>>,
{
    info!(job_id = job.id(), %stage, "stage started");
    job.set_step(stage, StepStatus::Running, stage.running_message());
    match work.await {
        Ok(value) => {
            job.set_step(stage, StepStatus::Success, stage.done_message());
            Ok(value)
        }
        Err(e) => {
            warn!(job_id = job.id(), %stage, error = %e, "stage failed");
            job.set_step(stage, StepStatus::Failed, e.to_string());
            Err(e)
        }
    }
}

async fn collect_artifact(
    job: &JobHandle,
    work_dir: &Path,
    src_dir: &Path,
    version: &str,
) -> Result<PathBuf, BuildError> {
    let artifact_dir = work_dir.join("artifact");
    tokio::fs::create_dir_all(&artifact_dir)
        .await
        .map_err(|e| BuildError::io("failed to create", &artifact_dir, e))?;

    let binary = src_dir.join("objs").join("nginx");
    let artifact = artifact_dir.join(format!("nginx-{}", version));
    tokio::fs::copy(&binary, &artifact)
        .await
        .map_err(|e| BuildError::io("failed to copy", &binary, e))?;

    job.append_log(format!("artifact written to {}", artifact.display()));
    job.set_artifact(artifact.clone());
    Ok(artifact)
}

/// The parsed configure arguments with any existing third-party module flags
/// removed, followed by `module_args`.
pub fn compose_configure_args(original: &[String], module_args: &[String]) -> Vec<String> {
    original
        .iter()
        .filter(|arg| !arg.starts_with("--add-module=") && !arg.starts_with("--add-dynamic-module="))
        .chain(module_args)
        .cloned()
        .collect()
}

/// A standalone bash script that reproduces the build outside the service.
pub fn build_script(source_url: &str, version: &str, configure_args: &[String]) -> String {
    let mut configure = String::from("./configure");
    for arg in configure_args {
        configure.push_str(" \\\n  ");
        configure.push_str(&shell_quote(arg));
    }

    format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

VERSION={version}
WORKDIR=./build-$VERSION

mkdir -p "$WORKDIR"
cd "$WORKDIR"

curl -fSL {source_url}/nginx-$VERSION.tar.gz -o nginx.tar.gz
tar -xzf nginx.tar.gz
cd nginx-$VERSION

{configure}
make -j"$(nproc)"

cp objs/nginx ./nginx-$VERSION
"#,
        source_url = source_url.trim_end_matches('/'),
    )
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}


#[cfg(all(test, unix))]
mod build_tests {
    use super::*;
    use crate::job::models::{CustomModuleRequest, Job, JobStatus};
    use crate::job::table::JobTable;
    use crate::job::testing::{FakeToolchain, SAMPLE_DUMP};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        fake: FakeToolchain,
        table: Arc<JobTable>,
        history: Arc<HistoryStore>,
        pipeline: BuildPipeline,
    }

    fn harness(fake: FakeToolchain) -> Harness {
        let registry = ModuleRegistry::from_json(
            r#"[
                {"name": "demo", "repo": "https://example.com/demo.git", "flag": "add-module"},
                {"name": "dyn", "repo": "https://example.com/dyn.git", "flag": "add-dynamic-module"},
                {"name": "local", "path": "local"}
            ]"#,
        )
        .unwrap();
        let history = Arc::new(HistoryStore::in_memory());
        let pipeline = BuildPipeline::new(fake.settings(), Arc::new(registry), Arc::clone(&history));
        Harness {
            fake,
            table: Arc::new(JobTable::new()),
            history,
            pipeline,
        }
    }

    impl Harness {
        async fn run(&self, id: &str, request: BuildRequest, ctx: &JobContext) -> (Result<(), BuildError>, Job) {
            self.table.insert(Job::new(id, request.clone()));
            let handle = JobHandle::new(Arc::clone(&self.table), id);
            handle.set_status(JobStatus::Running);
            let result = self.pipeline.run(&handle, &request, ctx).await;
            (result, self.table.get(id).unwrap())
        }
    }

    fn request(modules: &[&str]) -> BuildRequest {
        BuildRequest {
            output: SAMPLE_DUMP.to_string(),
            module_names: strings(modules),
            ..Default::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_full_build_succeeds() {
        let h = harness(FakeToolchain::new());
        let (result, job) = h
            .run("ok", request(&["demo", "dyn"]), &JobContext::unbounded())
            .await;
        result.unwrap();

        assert!(job.steps.iter().all(|s| s.status == StepStatus::Success));
        let artifact = job.artifact_path.clone().unwrap();
        assert_eq!(artifact, h.fake.work_root().join("ok/artifact/nginx-1.24.0"));
        assert!(artifact.is_file());
        assert_eq!(job.result.as_ref().unwrap().version, "1.24.0");

        let script = job.script.clone().unwrap();
        assert!(script.contains("VERSION=1.24.0"));
        assert_eq!(
            std::fs::read_to_string(h.fake.work_root().join("ok/build.sh")).unwrap(),
            script
        );

        let history = h.history.list().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "ok");
        assert_eq!(history[0].version, "1.24.0");
        assert_eq!(history[0].modules, vec!["demo", "dyn"]);
        assert_eq!(history[0].artifact.as_ref(), Some(&artifact));
    }

    #[tokio::test]
    async fn test_configure_receives_composed_args() {
        let h = harness(FakeToolchain::new());
        let mut req = request(&["demo"]);
        req.custom_modules.push(CustomModuleRequest {
            name: "extra".into(),
            repo: "https://example.com/extra.git".into(),
            flag: "add-dynamic-module".into(),
        });
        let (result, _job) = h.run("args", req, &JobContext::unbounded()).await;
        result.unwrap();

        let work = h.fake.work_root().join("args");
        let recorded = std::fs::read_to_string(work.join("nginx-1.24.0/configure.args")).unwrap();
        let args: Vec<&str> = recorded.lines().collect();
        assert!(args.contains(&"--prefix=/etc/nginx"));
        assert!(args.contains(&"--with-cc-opt=-g -O2"));
        assert!(!args.contains(&"--add-module=/opt/old"));
        let demo = format!("--add-module={}", work.join("modules/demo").display());
        let extra = format!("--add-dynamic-module={}", work.join("modules/extra").display());
        assert_eq!(&args[args.len() - 2..], &[demo.as_str(), extra.as_str()]);
        assert!(work.join("modules/demo").is_dir());
        assert!(work.join("modules/extra").is_dir());
    }

    #[tokio::test]
    async fn test_version_override_drives_download_and_artifact() {
        let h = harness(FakeToolchain::new());
        let mut req = request(&[]);
        req.target_version = Some(" 1.26.2 ".into());
        let (result, job) = h.run("override", req, &JobContext::unbounded()).await;
        result.unwrap();

        assert_eq!(job.result.unwrap().version, "1.26.2");
        assert!(job.artifact_path.unwrap().ends_with("artifact/nginx-1.26.2"));
        assert!(
            job.logs
                .lines()
                .iter()
                .any(|l| l.contains("https://nginx.example.test/download/nginx-1.26.2.tar.gz"))
        );
    }

    #[tokio::test]
    async fn test_parse_failure_stops_at_first_stage() {
        let h = harness(FakeToolchain::new());
        let mut req = request(&[]);
        req.output = "this is not nginx output".into();
        let (result, job) = h.run("bad-parse", req, &JobContext::unbounded()).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BuildError::Parse(_)));
        assert_eq!(job.step(Stage::ParseConfig).status, StepStatus::Failed);
        assert_eq!(job.step(Stage::ParseConfig).message, err.to_string());
        for stage in &Stage::ALL[1..] {
            assert_eq!(job.step(*stage).status, StepStatus::Pending);
        }
        assert!(job.result.is_none());
        assert!(!h.fake.work_root().join("bad-parse").exists());
    }

    #[tokio::test]
    async fn test_unknown_preset_names_the_module() {
        let h = harness(FakeToolchain::new());
        let (result, job) = h
            .run("unknown", request(&["no-such-module"]), &JobContext::unbounded())
            .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("no-such-module"));
        assert_eq!(job.step(Stage::PrepareSource).status, StepStatus::Success);
        assert_eq!(job.step(Stage::PrepareModules).status, StepStatus::Failed);
        assert_eq!(job.step(Stage::RunBuild).status, StepStatus::Pending);
        assert_eq!(job.step(Stage::CollectArtifact).status, StepStatus::Pending);
        assert!(job.artifact_path.is_none());
        assert!(h.history.is_empty());
    }

    #[tokio::test]
    async fn test_missing_local_module_must_be_provisioned() {
        let h = harness(FakeToolchain::new());
        let (result, job) = h.run("local", request(&["local"]), &JobContext::unbounded()).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("pre-provisioned"));
        assert_eq!(job.step(Stage::PrepareModules).status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_provisioned_local_module_is_used_in_place() {
        let h = harness(FakeToolchain::new());
        let local = h.fake.modules_root().join("local");
        std::fs::create_dir_all(&local).unwrap();

        let (result, _job) = h.run("local-ok", request(&["local"]), &JobContext::unbounded()).await;
        result.unwrap();
        let recorded = std::fs::read_to_string(
            h.fake.work_root().join("local-ok/nginx-1.24.0/configure.args"),
        )
        .unwrap();
        assert!(recorded.contains(&format!("--add-module={}", local.display())));
    }

    #[tokio::test]
    async fn test_download_failure_aborts_with_exit_code() {
        let h = harness(FakeToolchain::new().with_failing_curl());
        let (result, job) = h.run("no-net", request(&[]), &JobContext::unbounded()).await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("exit code 22"));
        assert_eq!(job.step(Stage::PrepareSource).status, StepStatus::Failed);
        assert_eq!(job.step(Stage::PrepareSource).message, err.to_string());
        assert!(job.logs.lines().iter().any(|l| l.contains("404")));
        assert_eq!(job.step(Stage::PrepareModules).status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_timeout_terminates_build_and_keeps_script() {
        let h = harness(FakeToolchain::new().with_hanging_make());
        let root = CancellationToken::new();
        let ctx = JobContext::new(&root, Some(Duration::from_millis(500)));
        let (result, job) = h.run("slow", request(&[]), &ctx).await;

        let err = result.unwrap_err();
        assert!(matches!(err, BuildError::Command(ref c) if c.is_timeout()));
        assert_eq!(job.step(Stage::RunBuild).status, StepStatus::Failed);
        assert!(job.step(Stage::RunBuild).message.contains("time limit"));
        assert!(job.script.is_some());
        assert!(h.fake.work_root().join("slow/build.sh").is_file());
        assert!(job.artifact_path.is_none());
    }
}
