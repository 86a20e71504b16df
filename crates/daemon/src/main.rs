//! Depot Daemon
//!
//! Serves per-device file storage and manages registered devices.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, is_dev_environment, Config, LoggingConfig};
use daemon::devices::SqliteDirectory;
use daemon::server::{DepotServer, ServerEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Depot Daemon - per-device file storage over SFTP.
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the storage server until SIGINT or SIGTERM
    Serve,

    /// Manage registered devices
    #[command(subcommand)]
    Devices(DevicesCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for device management.
#[derive(Subcommand, Debug, Clone)]
pub enum DevicesCommands {
    /// Register a device and print its credential
    Add {
        /// Device name (3-15 letters, digits or spaces)
        name: String,
    },

    /// List registered devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Issue a new access token for a device
    Rotate {
        /// Device identifier
        device_id: String,
    },

    /// Remove a device
    Remove {
        /// Device identifier
        device_id: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _guard = init_tracing(&config.logging, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Serve => run_server(config).await?,
        Commands::Devices(command) => run_devices_command(&config, command)?,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }

    Ok(())
}

/// Install the tracing subscriber.
///
/// Logs go to a daily rolling file when a log directory is configured and to
/// stderr otherwise.
fn init_tracing(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.effective_level(is_dev_environment())
    };
    let filter = EnvFilter::try_new(&level)
        .with_context(|| format!("Invalid log level: {}", level))?;

    match &logging.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;
            let appender = tracing_appender::rolling::daily(directory, "depotd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Run the server until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let directory = Arc::new(
        SqliteDirectory::open(&config.directory.database_path).with_context(|| {
            format!(
                "Failed to open device database: {}",
                config.directory.database_path.display()
            )
        })?,
    );

    let mut server = DepotServer::new(config, directory)?;

    // Subscribe before starting so no lifecycle event is missed
    let mut events = server.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::StateChanged(state) => {
                    tracing::debug!("Server state: {:?}", state);
                }
                ServerEvent::DeviceConnected { device_id, peer } => {
                    tracing::debug!("Device {} connected from {}", device_id, peer);
                }
                ServerEvent::DeviceDisconnected { device_id, reason } => {
                    tracing::debug!("Device {} disconnected ({})", device_id, reason);
                }
                ServerEvent::AuthenticationRejected { peer } => {
                    tracing::debug!("Rejected credential from {}", peer);
                }
            }
        }
    });

    server.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    server.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

/// Execute a `devices` subcommand against the configured database.
fn run_devices_command(config: &Config, command: DevicesCommands) -> anyhow::Result<()> {
    let directory = SqliteDirectory::open(&config.directory.database_path).with_context(|| {
        format!(
            "Failed to open device database: {}",
            config.directory.database_path.display()
        )
    })?;

    match command {
        DevicesCommands::Add { name } => {
            let credential = directory.register_device(&name)?;
            println!("Registered device \"{}\"", name);
            println!("  Device ID:    {}", credential.device_id);
            println!("  Access token: {}", credential.access_token);
            println!();
            println!("The access token is not shown again; store it on the device now.");
        }
        DevicesCommands::List { json } => {
            let devices = directory.list_devices()?;
            if json {
                let rows: Vec<_> = devices
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "device_id": d.identifier.to_string(),
                            "name": d.name,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if devices.is_empty() {
                println!("No devices registered.");
            } else {
                println!("{:<36}  NAME", "DEVICE ID");
                for device in devices {
                    println!("{:<36}  {}", device.identifier, device.name);
                }
            }
        }
        DevicesCommands::Rotate { device_id } => {
            let id = parse_device_id(&device_id)?;
            match directory.rotate_token(&id)? {
                Some(token) => {
                    println!("New access token for {}: {}", id, token);
                }
                None => anyhow::bail!("Device not found: {}", id),
            }
        }
        DevicesCommands::Remove { device_id } => {
            let id = parse_device_id(&device_id)?;
            if !directory.remove_device(&id)? {
                anyhow::bail!("Device not found: {}", id);
            }
            println!("Removed device {}", id);
        }
    }

    Ok(())
}

/// Parse a device identifier argument.
fn parse_device_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid device ID: {}", raw))
}
