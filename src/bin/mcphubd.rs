//! `mcphubd`: the daemon host binary. Invoked directly to manage the
//! keep-alive daemon (`daemon start|stop|status`), and re-executed by
//! the keep-alive runtime's auto-launch path (`daemon start --foreground`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mcphub::catalog::{CatalogLoader, TomlCatalogLoader};
use mcphub::daemon::{client, host, metadata};
use mcphub::error::Result;
use mcphub::runtime::Runtime;

#[derive(Parser)]
#[command(name = "mcphubd", about = "mcphub keep-alive daemon host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the keep-alive daemon for a catalog.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon. Without `--foreground`, spawns a detached host and
    /// waits for it to become responsive before returning.
    Start {
        #[arg(long, default_value = "~/.mcporter/catalog.toml")]
        config: String,
        #[arg(long)]
        foreground: bool,
        /// Log every served call, regardless of per-server opt-in.
        #[arg(long)]
        log: bool,
        /// Write daemon log entries to this path instead of the default
        /// `~/.mcporter/daemon/<hash>.log`. Implies `--log`.
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Comma-separated list of server names to log, without logging every
        /// server's calls.
        #[arg(long, value_delimiter = ',')]
        log_servers: Vec<String>,
    },
    /// Ask a running daemon to stop.
    Stop {
        #[arg(long, default_value = "~/.mcporter/catalog.toml")]
        config: String,
    },
    /// Report whether a daemon is running for this catalog.
    Status {
        #[arg(long, default_value = "~/.mcporter/catalog.toml")]
        config: String,
    },
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mcphubd: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Daemon { action } => match action {
            DaemonAction::Start {
                config,
                foreground,
                log,
                log_file,
                log_servers,
            } => {
                let options = host::LoggingOptions {
                    log,
                    log_file,
                    log_servers,
                }
                .merge_env();
                start(config, foreground, options).await
            }
            DaemonAction::Stop { config } => stop(config).await,
            DaemonAction::Status { config } => status(config).await,
        },
    }
}

async fn start(config: String, foreground: bool, logging: host::LoggingOptions) -> Result<()> {
    let config_path = expand_tilde(&config);

    let socket_path = metadata::socket_path(&config_path).ok_or_else(|| {
        mcphub::error::HubError::RuntimeError("could not determine daemon socket path".to_string())
    })?;
    let metadata_path = metadata::metadata_path(&config_path).ok_or_else(|| {
        mcphub::error::HubError::RuntimeError("could not determine daemon metadata path".to_string())
    })?;

    if !foreground {
        client::ensure_daemon_running(&config_path, &socket_path).await?;
        println!("daemon running at {}", socket_path.display());
        return Ok(());
    }

    let definitions = TomlCatalogLoader::new(&config_path).load()?;
    let logger = host::DaemonLogger::from_options(&logging, &config_path, &definitions);
    let runtime = Runtime::new(definitions);

    let daemon = host::DaemonHost::new(runtime, config_path, socket_path, metadata_path, logger).await?;
    daemon.run().await
}

async fn stop(config: String) -> Result<()> {
    let config_path = expand_tilde(&config);
    let socket_path = metadata::socket_path(&config_path).ok_or_else(|| {
        mcphub::error::HubError::RuntimeError("could not determine daemon socket path".to_string())
    })?;
    client::send_request(&socket_path, mcphub::daemon::protocol::METHOD_STOP, serde_json::json!({}))
        .await?;
    println!("stop requested");
    Ok(())
}

async fn status(config: String) -> Result<()> {
    let config_path = expand_tilde(&config);
    let socket_path = metadata::socket_path(&config_path).ok_or_else(|| {
        mcphub::error::HubError::RuntimeError("could not determine daemon socket path".to_string())
    })?;
    let alive = client::probe_status(&socket_path).await;
    println!("{{\"running\": {alive}, \"socket\": \"{}\"}}", socket_path.display());
    Ok(())
}
