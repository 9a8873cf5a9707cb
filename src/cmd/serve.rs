//! HTTP service command: `nginx-automake serve`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use nginx_automake::config::Settings;
use nginx_automake::http::{AppState, ServerConfig, start_server};
use nginx_automake::job::history::HistoryStore;
use nginx_automake::job::pipeline::BuildPipeline;
use nginx_automake::job::queue::{BuildQueue, QueueConfig};
use nginx_automake::modules::registry::ModuleRegistry;

pub async fn cmd_serve(settings: Settings, dev: bool) -> Result<()> {
    let registry = ModuleRegistry::load(settings.registry_file.as_deref())
        .context("failed to load module registry")?;
    info!(presets = registry.len(), "module registry loaded");

    let history = HistoryStore::open(&settings.history_file)
        .context("failed to open build history")?;
    info!(
        path = %settings.history_file.display(),
        entries = history.len(),
        "build history loaded"
    );

    let registry = Arc::new(registry);
    let history = Arc::new(history);
    let pipeline = BuildPipeline::new(
        settings.pipeline_settings(),
        Arc::clone(&registry),
        Arc::clone(&history),
    );
    let queue = BuildQueue::start(
        QueueConfig {
            workers: settings.workers,
            capacity: settings.queue_capacity,
            timeout: settings.timeout,
        },
        pipeline,
        history,
    );

    let state = Arc::new(AppState { queue, registry });
    start_server(
        ServerConfig {
            addr: settings.socket_addr(),
            dev_mode: dev,
        },
        state,
    )
    .await
}
