//! Command-line host for the flow tunnel.
//!
//! `connect` starts a tunnel against the configured server, prints the
//! configuration the server pushed and keeps the session up until Ctrl-C or
//! until the server goes away. Flow interception belongs to the platform
//! integration, so this host never admits flows itself.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tunnel_core::config::{Config, ConfigError, ConfigManager};
use tunnel_core::logging::{LogFile, LogOptions, parse_level};
use tunnel_core::transport::TcpClient;
use tunnel_core::{TunnelConfig, TunnelController, TunnelError, TunnelEvent, TunnelSettings};

/// Flow tunnel client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (default: the user config directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Also write daily-rotated logs into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands
#[derive(Subcommand)]
enum Commands {
    /// Connect to the tunnel server and stay up until interrupted
    Connect {
        /// Server address, overriding the configuration file
        #[arg(short, long, value_name = "HOST:PORT")]
        server: Option<String>,

        /// Fail when the server pushes no DNS servers
        #[arg(long)]
        require_dns: bool,
    },
    /// Validate the configuration file and print the effective settings
    CheckConfig,
    /// Write a configuration file with default values
    InitConfig {
        /// Server address to put in the file
        #[arg(short, long, value_name = "HOST:PORT")]
        server: String,
    },
}

/// Error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    TunnelError(#[from] TunnelError),

    /// The session ended without being asked to
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Load the configuration file named on the command line.
    pub fn load_config(&self) -> Result<ConfigManager, ConfigError> {
        ConfigManager::load(self.config_path())
    }

    /// Logging options from the flags, falling back to the file's level.
    pub fn log_options(&self, config: Option<&ConfigManager>) -> LogOptions {
        let level = self
            .log_level
            .as_deref()
            .or_else(|| config.map(|manager| manager.config().log_level.as_str()))
            .map(parse_level)
            .unwrap_or(tracing::Level::INFO);

        LogOptions {
            level,
            json: self.json_logs,
            file: self.log_dir.as_ref().map(LogFile::new),
            ..Default::default()
        }
    }
}

/// Run the CLI application
pub async fn run(cli: Cli, config: Result<ConfigManager, ConfigError>) -> CliResult<()> {
    let path = cli.config_path();
    match cli.command {
        Some(Commands::InitConfig { server }) => init_config(&path, server),
        Some(Commands::CheckConfig) => {
            let manager = config?;
            print_config(manager.config());
            Ok(())
        }
        Some(Commands::Connect {
            server,
            require_dns,
        }) => {
            let mut manager = config?;
            if let Some(server) = server {
                manager.config_mut().client.server_address = Some(server);
            }
            if require_dns {
                manager.config_mut().settings.require_dns = true;
            }
            manager.config().validate()?;
            connect(manager.config()).await
        }
        None => {
            let manager = config?;
            connect(manager.config()).await
        }
    }
}

fn init_config(path: &Path, server: String) -> CliResult<()> {
    let mut config = Config::default();
    config.client.server_address = Some(server);
    config.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(path)?;
    info!("Wrote configuration to {:?}", path);
    Ok(())
}

fn print_config(config: &Config) {
    println!("server_address           = {}", config.client.server_address.as_deref().unwrap_or("-"));
    println!("connect_timeout_ms       = {}", config.client.connect_timeout_ms);
    println!("configuration_timeout_ms = {}", config.client.configuration_timeout_ms);
    println!("max_frame_size           = {}", config.protocol.max_frame_size);
    println!("max_data_chunk           = {}", config.protocol.max_data_chunk);
    println!("outbound_queue_depth     = {}", config.protocol.outbound_queue_depth);
    println!("require_dns              = {}", config.settings.require_dns);
    println!("log_level                = {}", config.log_level);
}

fn print_settings(settings: &TunnelSettings) {
    let servers = settings.dns_servers();
    if servers.is_empty() {
        println!("DNS servers:    (none)");
    } else {
        println!("DNS servers:    {}", servers.join(", "));
    }
    if !settings.search_domains().is_empty() {
        println!("Search domains: {}", settings.search_domains().join(", "));
    }
    for key in settings.keys() {
        if key.as_str() != tunnel_core::proto::settings::DNS_KEY
            && key.as_str() != tunnel_core::proto::settings::SEARCH_DOMAINS_KEY
        {
            if let Some(value) = settings.get(key) {
                println!("{}: {}", key, value);
            }
        }
    }
}

async fn connect(config: &Config) -> CliResult<()> {
    let tunnel_config = TunnelConfig::from_global_config(config)?;
    let controller = TunnelController::new(Arc::new(TcpClient::new()));
    let mut events = controller.subscribe();

    info!(server = %tunnel_config.server_address, "Connecting");
    tokio::select! {
        result = controller.start(tunnel_config) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while connecting");
            return match controller.stop().await {
                Ok(()) | Err(TunnelError::AlreadyStopped) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
    }

    if let Some(settings) = controller.configuration() {
        print_settings(&settings);
    }
    println!("Tunnel established, press Ctrl-C to disconnect");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Disconnecting");
                if let Some(stats) = controller.stats() {
                    info!(
                        uptime = ?stats.uptime(),
                        bytes_sent = stats.bytes_sent,
                        bytes_received = stats.bytes_received,
                        "Session statistics"
                    );
                }
                controller.stop().await?;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::StateChanged(state)) => debug!(%state, "Tunnel state"),
                Ok(TunnelEvent::Cancelled { reason }) => {
                    warn!(%reason, "Tunnel closed by the session");
                    return Err(CliError::Disconnected(reason));
                }
                Err(e) => debug!(error = %e, "Missed tunnel events"),
            },
        }
    }
}
