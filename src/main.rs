use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nginx_automake::config::Settings;

mod cmd;

#[derive(Parser)]
#[command(name = "nginx-automake")]
#[command(
    version,
    about = "Rebuild nginx from source with extra modules, matching an existing `nginx -V`"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Settings file. Defaults to ./automake.toml when it exists
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and build workers (the default)
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of concurrent builds
        #[arg(short, long)]
        workers: Option<usize>,

        /// Allow cross-origin requests from a dev frontend
        #[arg(long)]
        dev: bool,
    },
    /// Parse an `nginx -V` dump and print version and arguments as JSON
    Parse {
        /// File holding the dump, or `-` for stdin
        #[arg(default_value = "-")]
        input: PathBuf,
    },
    /// List the preset modules
    Modules {
        #[arg(long)]
        json: bool,
    },
    /// Show recorded builds, newest first
    History {
        /// Only show the newest N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("nginx_automake={level},tower_http={level}"))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    // `parse` works offline and never reads settings.
    let settings = || Settings::load(cli.config.as_deref()).context("Failed to load settings");

    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        workers: None,
        dev: false,
    });
    match command {
        Commands::Serve { port, workers, dev } => {
            cmd::cmd_serve(settings()?.with_overrides(port, workers), dev).await?;
        }
        Commands::Parse { input } => cmd::cmd_parse(&input)?,
        Commands::Modules { json } => cmd::cmd_modules(&settings()?, json)?,
        Commands::History { limit, json } => cmd::cmd_history(&settings()?, limit, json)?,
        Commands::Config => cmd::cmd_config(&settings()?)?,
    }

    Ok(())
}
