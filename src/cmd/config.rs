//! Effective configuration view: `nginx-automake config`.

use anyhow::Result;

use nginx_automake::config::Settings;

pub fn cmd_config(settings: &Settings) -> Result<()> {
    println!();
    println!("nginx-automake configuration");
    println!("============================");
    println!();

    println!("[server]");
    println!("  bind = \"{}\"", settings.bind);
    println!("  port = {}", settings.port);
    println!();

    println!("[build]");
    println!("  workers = {}", settings.workers);
    println!("  queue_capacity = {}", settings.queue_capacity);
    match settings.timeout {
        Some(timeout) => println!("  timeout = \"{}\"", humantime::format_duration(timeout)),
        None => println!("  timeout = \"0\"  # disabled"),
    }
    println!("  source_url = \"{}\"", settings.source_url);
    println!();

    println!("[storage]");
    println!("  work_root = \"{}\"", settings.work_root.display());
    println!("  modules_dir = \"{}\"", settings.modules_dir.display());
    println!("  history_file = \"{}\"", settings.history_file.display());
    match &settings.registry_file {
        Some(path) => println!("  registry_file = \"{}\"", path.display()),
        None => println!("  # registry_file unset, using built-in presets"),
    }
    println!();

    println!("[toolchain]");
    println!("  curl = \"{}\"", settings.toolchain.curl);
    println!("  tar = \"{}\"", settings.toolchain.tar);
    println!("  git = \"{}\"", settings.toolchain.git);
    println!("  make = \"{}\"", settings.toolchain.make);
    println!();

    Ok(())
}
