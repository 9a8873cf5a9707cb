//! List the preset modules.

use anyhow::{Context, Result};

use nginx_automake::config::Settings;
use nginx_automake::modules::registry::ModuleRegistry;

pub fn cmd_modules(settings: &Settings, json: bool) -> Result<()> {
    let registry = ModuleRegistry::load(settings.registry_file.as_deref())
        .context("failed to load module registry")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&registry.list())?);
        return Ok(());
    }

    if registry.is_empty() {
        println!("No preset modules configured.");
        return Ok(());
    }

    let width = registry
        .list()
        .iter()
        .map(|m| m.name.len())
        .max()
        .unwrap_or(0);
    for module in registry.list() {
        println!(
            "{:<width$}  {:<18}  {}",
            module.name,
            module.flag.as_str(),
            module.description,
        );
    }
    Ok(())
}
