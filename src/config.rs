//! Layered service settings.
//!
//! Values are resolved in order, each layer overriding the previous one:
//! built-in defaults, then an optional TOML file, then environment
//! variables, then command-line flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8080
//! bind = "0.0.0.0"
//!
//! [build]
//! workers = 2
//! queue_capacity = 100
//! timeout = "90m"
//! work_root = "/tmp/nginx-build"
//! modules_dir = "./modules"
//! source_url = "https://nginx.org/download"
//!
//! [storage]
//! history_file = "./data/history.json"
//! registry_file = "./config/modules.json"
//!
//! [toolchain]
//! curl = "curl"
//! tar = "tar"
//! git = "git"
//! make = "make"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ConfigError;
use crate::job::pipeline::PipelineSettings;

/// File picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "automake.toml";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// External programs a build shells out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub curl: String,
    pub tar: String,
    pub git: String,
    pub make: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            curl: "curl".to_string(),
            tar: "tar".to_string(),
            git: "git".to_string(),
            make: "make".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub bind: IpAddr,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Whole-job time limit. `None` disables it.
    pub timeout: Option<Duration>,
    pub work_root: PathBuf,
    pub modules_dir: PathBuf,
    pub source_url: String,
    pub history_file: PathBuf,
    /// Replaces the compiled-in module registry when set.
    pub registry_file: Option<PathBuf>,
    pub toolchain: Toolchain,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            workers: 2,
            queue_capacity: 100,
            timeout: Some(DEFAULT_TIMEOUT),
            work_root: PathBuf::from("/tmp/nginx-build"),
            modules_dir: PathBuf::from("./modules"),
            source_url: "https://nginx.org/download".to_string(),
            history_file: PathBuf::from("./data/history.json"),
            registry_file: None,
            toolchain: Toolchain::default(),
        }
    }
}

/// Raw TOML structure for the settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    server: Option<ServerSection>,
    build: Option<BuildSection>,
    storage: Option<StorageSection>,
    toolchain: Option<ToolchainSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    port: Option<u16>,
    bind: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    timeout: Option<String>,
    work_root: Option<PathBuf>,
    modules_dir: Option<PathBuf>,
    source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageSection {
    history_file: Option<PathBuf>,
    registry_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolchainSection {
    curl: Option<String>,
    tar: Option<String>,
    git: Option<String>,
    make: Option<String>,
}

impl Settings {
    /// Defaults, then `config_file` (or `automake.toml` if present), then the
    /// process environment. Paths are made absolute.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        let default_file = Path::new(DEFAULT_CONFIG_FILE);
        match config_file {
            Some(path) => settings.apply_file(path)?,
            None if default_file.is_file() => settings.apply_file(default_file)?,
            None => {}
        }

        settings.apply_env(|key| std::env::var(key).ok());
        settings.normalize();
        Ok(settings)
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_toml(&content, path)
    }

    fn apply_toml(&mut self, content: &str, path: &Path) -> Result<(), ConfigError> {
        let raw: RawSettings = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(server) = raw.server {
            set(&mut self.port, server.port);
            set(&mut self.bind, server.bind);
        }
        if let Some(build) = raw.build {
            set(&mut self.workers, build.workers);
            set(&mut self.queue_capacity, build.queue_capacity);
            if let Some(value) = build.timeout {
                self.timeout = parse_timeout(&value)
                    .map_err(|source| ConfigError::Timeout { value, source })?;
            }
            set(&mut self.work_root, build.work_root);
            set(&mut self.modules_dir, build.modules_dir);
            set(&mut self.source_url, build.source_url);
        }
        if let Some(storage) = raw.storage {
            set(&mut self.history_file, storage.history_file);
            if storage.registry_file.is_some() {
                self.registry_file = storage.registry_file;
            }
        }
        if let Some(tools) = raw.toolchain {
            set(&mut self.toolchain.curl, tools.curl);
            set(&mut self.toolchain.tar, tools.tar);
            set(&mut self.toolchain.git, tools.git);
            set(&mut self.toolchain.make, tools.make);
        }
        Ok(())
    }

    /// Override from environment variables read through `lookup`. Values that
    /// fail to parse are skipped with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("PORT") {
            set(&mut self.port, parse_or_warn("PORT", &v));
        }
        if let Some(v) = var("BIND_ADDR") {
            set(&mut self.bind, parse_or_warn("BIND_ADDR", &v));
        }
        if let Some(v) = var("MAX_WORKERS") {
            set(&mut self.workers, parse_or_warn("MAX_WORKERS", &v));
        }
        if let Some(v) = var("QUEUE_CAPACITY") {
            set(&mut self.queue_capacity, parse_or_warn("QUEUE_CAPACITY", &v));
        }
        if let Some(v) = var("BUILD_TIMEOUT") {
            match parse_timeout(&v) {
                Ok(timeout) => self.timeout = timeout,
                Err(e) => warn!(value = %v, error = %e, "ignoring invalid BUILD_TIMEOUT"),
            }
        }
        set(&mut self.modules_dir, var("MODULES_DIR").map(PathBuf::from));
        set(&mut self.work_root, var("WORKDIR").map(PathBuf::from));
        set(&mut self.history_file, var("HISTORY_FILE").map(PathBuf::from));
        if let Some(v) = var("REGISTRY_FILE") {
            self.registry_file = Some(PathBuf::from(v));
        }
        set(&mut self.source_url, var("NGINX_SOURCE_URL"));
        set(&mut self.toolchain.curl, var("CURL_CMD"));
        set(&mut self.toolchain.tar, var("TAR_CMD"));
        set(&mut self.toolchain.git, var("GIT_CMD"));
        set(&mut self.toolchain.make, var("MAKE_CMD"));
    }

    /// Apply command-line overrides, then re-normalize.
    pub fn with_overrides(mut self, port: Option<u16>, workers: Option<usize>) -> Self {
        set(&mut self.port, port);
        set(&mut self.workers, workers);
        self.normalize();
        self
    }

    /// Clamp counts to at least one and make paths absolute, since builds
    /// run subprocesses in other directories.
    pub fn normalize(&mut self) {
        self.workers = self.workers.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        for path in [
            &mut self.work_root,
            &mut self.modules_dir,
            &mut self.history_file,
        ] {
            if let Ok(abs) = std::path::absolute(&*path) {
                *path = abs;
            }
        }
        if let Some(registry) = self.registry_file.as_mut()
            && let Ok(abs) = std::path::absolute(&*registry)
        {
            *registry = abs;
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_root: self.work_root.clone(),
            modules_root: self.modules_dir.clone(),
            source_url: self.source_url.clone(),
            toolchain: self.toolchain.clone(),
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_or_warn<T>(key: &str, value: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key, value, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

/// Parse a human duration such as `90m` or `1h 30m`. `0` or any zero
/// duration disables the limit.
pub fn parse_timeout(value: &str) -> Result<Option<Duration>, humantime::DurationError> {
    let value = value.trim();
    if value == "0" {
        return Ok(None);
    }
    let duration = humantime::parse_duration(value)?;
    Ok(Some(duration).filter(|d| !d.is_zero()))
}
