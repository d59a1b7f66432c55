//! HezarDastan Core server binary

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use tracing::{error, info};

use hezardastan_core::config::LoggingConfig;
use hezardastan_core::{logging, signals, CoreConfig, CoreServer, VERSION};

/// HezarDastan Core
#[derive(Parser)]
#[command(name = "hezardastan")]
#[command(about = "Obfuscated tunnel server (OTLS/WS and AOQUIC)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// TCP listen address for OTLS/WS
        #[arg(long)]
        tcp: Option<String>,

        /// UDP listen address for AOQUIC
        #[arg(long)]
        udp: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
    /// Generate a sample configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "hezardastan.yaml")]
        output: PathBuf,

        /// Configuration format (yaml, toml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },
    /// Check configuration file
    Check {
        /// Configuration file path
        #[arg(short, long, default_value = "hezardastan.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            tcp,
            udp,
            verbose,
        } => start_server(config, tcp, udp, verbose).await,
        Commands::Config { output, format } => {
            logging::init(&LoggingConfig::default(), false)?;
            generate_config(output, format)
        }
        Commands::Check { config } => {
            logging::init(&LoggingConfig::default(), false)?;
            check_config(config)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CoreConfig> {
    let mut config = match path {
        Some(path) => CoreConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CoreConfig::default(),
    };

    config
        .apply_env_overrides()
        .context("Invalid environment override")?;
    Ok(config)
}

async fn start_server(
    config_path: Option<PathBuf>,
    tcp_override: Option<String>,
    udp_override: Option<String>,
    verbose: bool,
) -> Result<()> {
    let mut config = load_config(config_path.as_ref())?;

    if let Some(tcp) = tcp_override {
        config.server.tcp_listen_addr = tcp;
    }
    if let Some(udp) = udp_override {
        config.server.udp_listen_addr = udp;
    }

    logging::init(&config.logging, verbose).context("Failed to initialize logging")?;

    info!("Starting HezarDastan Core v{}", VERSION);
    match &config_path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Using default configuration"),
    }

    info!("Server configuration:");
    info!("  TCP listen address: {}", config.server.tcp_listen_addr);
    info!("  UDP listen address: {}", config.server.udp_listen_addr);
    info!("  Max connections: {}", config.server.max_connections);
    info!("  Enabled protocols: {:?}", config.server.enabled_protocols);
    info!("  Kill switch enabled: {}", config.kill_switch.enabled);

    let server = CoreServer::bind(config)
        .await
        .context("Failed to bind server")?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(signals::shutdown_on(signals::wait_for_shutdown(), shutdown));

    server.run().await.context("Server failed")?;

    info!("Server stopped gracefully");
    Ok(())
}

fn generate_config(output: PathBuf, format: String) -> Result<()> {
    info!("Generating sample configuration file: {}", output.display());
    let config = CoreConfig::sample();

    let content = match format.as_str() {
        "yaml" | "yml" => serde_yaml::to_string(&config)
            .context("Failed to serialize configuration to YAML")?,
        "toml" => toml::to_string_pretty(&config)
            .context("Failed to serialize configuration to TOML")?,
        "json" => serde_json::to_string_pretty(&config)
            .context("Failed to serialize configuration to JSON")?,
        other => bail!("Unsupported format: {}. Use yaml, toml, or json", other),
    };

    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write configuration to {}", output.display()))?;

    info!("Configuration file generated successfully");
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    info!("Checking configuration file: {}", path.display());

    let config = load_config(Some(&path))?;
    if let Err(e) = config.validate() {
        error!("Configuration is invalid: {}", e);
        return Err(e).with_context(|| format!("Configuration {} is invalid", path.display()));
    }

    info!("Configuration is valid");
    info!("  TCP listen address: {}", config.server.tcp_listen_addr);
    info!("  UDP listen address: {}", config.server.udp_listen_addr);
    info!("  Enabled protocols: {:?}", config.server.enabled_protocols);
    if config.server.authorized_users.is_empty() {
        info!("  Authorized users: any");
    } else {
        info!("  Authorized users: {}", config.server.authorized_users.len());
    }
    info!("  Log level: {}", config.logging.level);
    Ok(())
}
