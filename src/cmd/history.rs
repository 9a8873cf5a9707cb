//! Print recorded builds from the history file.

use anyhow::{Context, Result};

use nginx_automake::config::Settings;
use nginx_automake::job::history::HistoryStore;

pub fn cmd_history(settings: &Settings, limit: Option<usize>, json: bool) -> Result<()> {
    let store = HistoryStore::open(&settings.history_file)
        .context("failed to open build history")?;
    let mut entries = store.list()?;
    if let Some(limit) = limit {
        entries.truncate(limit);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No builds recorded in {}", settings.history_file.display());
        return Ok(());
    }

    for entry in entries {
        let modules = if entry.modules.is_empty() {
            "-".to_string()
        } else {
            entry.modules.join(",")
        };
        println!(
            "{}  {}  {:<7}  {:<8}  {}",
            entry.id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status.as_str(),
            entry.version,
            modules,
        );
        if let Some(error) = entry.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}
