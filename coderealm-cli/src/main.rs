mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser)]
#[command(name = "coderealm")]
#[command(about = "Run untrusted JavaScript in an isolated realm")]
#[command(version = "0.2.0")]
pub struct Cli {
    /// Config file (default: ~/.config/coderealm/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a script in a fresh realm
    Run {
        /// Script to execute
        file: PathBuf,

        /// Language tag of the script
        #[arg(short, long, default_value = "javascript")]
        language: String,

        /// Execution timeout in milliseconds (clamped to the configured maximum)
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Caller identity used for rate limiting
        #[arg(long, default_value = coderealm_sandbox::ANONYMOUS_CALLER)]
        caller: String,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the static sanitizer only and show what it would inject
    Check {
        /// Script to check
        file: PathBuf,

        /// Language tag of the script
        #[arg(short, long, default_value = "javascript")]
        language: String,
    },
    /// Show the realm capability table and boundary headers
    Policy,
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Option<WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "coderealm={},coderealm_sandbox={},coderealm_common={}",
            log_level, log_level, log_level
        ))
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "coderealm.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log_file.as_ref());

    let config = commands::load_config(cli.config.as_deref())?;

    let ok = match cli.command {
        Commands::Run {
            file,
            language,
            timeout_ms,
            caller,
            json,
        } => commands::execute_run(config, &file, language, timeout_ms, caller, json).await?,
        Commands::Check { file, language } => {
            commands::execute_check(&config, &file, &language).await?
        }
        Commands::Policy => {
            commands::execute_policy(&config)?;
            true
        }
    };

    if !ok {
        // Flush the file appender before leaving
        drop(_guard);
        std::process::exit(1);
    }
    Ok(())
}
