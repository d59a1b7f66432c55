//! Configuration management for HezarDastan Core
//!
//! Configuration is read from a YAML, TOML or JSON file (picked by extension),
//! then overridden from `HEZARDASTAN_*` environment variables.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::protocols::ProtocolType;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Listener and admission settings
    pub server: ServerConfig,
    /// OTLS/WS protocol settings
    pub otls_ws: OtlsWsConfig,
    /// AOQUIC protocol settings
    pub aoquic: AoQuicConfig,
    /// Traffic obfuscation settings
    pub obfuscation: ObfuscationConfig,
    /// Kill switch settings
    pub kill_switch: KillSwitchConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Listener and admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address for OTLS/WS (mimics HTTPS)
    pub tcp_listen_addr: String,
    /// UDP listen address for AOQUIC
    pub udp_listen_addr: String,
    /// Maximum number of concurrent TCP connections
    pub max_connections: usize,
    /// Idle timeout for a TCP connection in milliseconds
    pub connection_timeout_ms: u64,
    /// Protocols the server listens for
    pub enabled_protocols: Vec<ProtocolType>,
    /// Users allowed to open tunnels. Empty means any user.
    pub authorized_users: Vec<Uuid>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_listen_addr: "0.0.0.0:8443".to_string(),
            udp_listen_addr: "0.0.0.0:8444".to_string(),
            max_connections: 1024,
            connection_timeout_ms: 30_000,
            enabled_protocols: vec![ProtocolType::OtlsWs, ProtocolType::AoQuic],
            authorized_users: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn is_enabled(&self, protocol: ProtocolType) -> bool {
        self.enabled_protocols.contains(&protocol)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// OTLS/WS protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlsWsConfig {
    /// Path of the WebSocket upgrade request
    pub path: String,
    /// Host header a client must present
    pub mimic_domain: String,
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
    /// Optional `host:port` to relay tunnel payloads to
    pub upstream: Option<String>,
    /// Handshake deadline in milliseconds
    pub handshake_timeout_ms: u64,
}

impl Default for OtlsWsConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            mimic_domain: "www.google.com".to_string(),
            max_frame_size: 1024 * 1024,
            upstream: None,
            handshake_timeout_ms: 10_000,
        }
    }
}

/// AOQUIC protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AoQuicConfig {
    /// Maximum number of concurrent sessions
    pub max_sessions: usize,
    /// Sessions idle for longer than this are dropped
    pub session_idle_timeout_ms: u64,
    /// Receive buffer size for a single datagram
    pub max_datagram_size: usize,
    /// Optional `host:port` to relay datagrams to
    pub upstream: Option<String>,
}

impl Default for AoQuicConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4096,
            session_idle_timeout_ms: 60_000,
            max_datagram_size: 65_535,
            upstream: None,
        }
    }
}

impl AoQuicConfig {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }
}

/// Traffic obfuscation settings. Values bound the parameters the obfuscator
/// mutates between.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    /// Upper bound on random padding appended to each envelope
    pub max_padding: usize,
    /// Chance of prefixing an envelope with a fake HTTP request head
    pub mimicry_probability: f64,
    /// Upper bound on the random send delay in milliseconds
    pub max_jitter_ms: u64,
    /// Seconds between parameter mutations
    pub mutation_interval_secs: u64,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            max_padding: 15,
            mimicry_probability: 0.3,
            max_jitter_ms: 49,
            mutation_interval_secs: 60,
        }
    }
}

/// Kill switch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Whether the kill switch is active
    pub enabled: bool,
    /// A tunnel without heartbeats for this long is considered down
    pub heartbeat_timeout_ms: u64,
    /// Health check interval
    pub check_interval_ms: u64,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_timeout_ms: 15_000,
            check_interval_ms: 1_000,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                CoreError::configuration(format!("Failed to parse YAML config: {}", e))
            }),
            Some("toml") => toml::from_str(&content).map_err(|e| {
                CoreError::configuration(format!("Failed to parse TOML config: {}", e))
            }),
            Some("json") => serde_json::from_str(&content).map_err(|e| {
                CoreError::configuration(format!("Failed to parse JSON config: {}", e))
            }),
            _ => Err(CoreError::configuration(
                "Unsupported config file format. Use .yaml, .toml, or .json",
            )),
        }
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            Some("toml") => toml::to_string_pretty(self)?,
            Some("json") => serde_json::to_string_pretty(self)?,
            _ => {
                return Err(CoreError::configuration(
                    "Unsupported config file format. Use .yaml, .toml, or .json",
                ))
            }
        };

        std::fs::write(path, content).map_err(|e| {
            CoreError::configuration(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Override settings from `HEZARDASTAN_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("HEZARDASTAN_TCP_ADDR") {
            self.server.tcp_listen_addr = addr;
        }

        if let Some(addr) = lookup("HEZARDASTAN_UDP_ADDR") {
            self.server.udp_listen_addr = addr;
        }

        if let Some(max) = lookup("HEZARDASTAN_MAX_CONNECTIONS") {
            self.server.max_connections = max.parse().map_err(|_| {
                CoreError::configuration(format!(
                    "HEZARDASTAN_MAX_CONNECTIONS must be a number, got {}",
                    max
                ))
            })?;
        }

        if let Some(level) = lookup("HEZARDASTAN_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(enabled) = lookup("HEZARDASTAN_KILL_SWITCH") {
            self.kill_switch.enabled = enabled.parse().map_err(|_| {
                CoreError::configuration(format!(
                    "HEZARDASTAN_KILL_SWITCH must be true or false, got {}",
                    enabled
                ))
            })?;
        }

        if let Some(domain) = lookup("HEZARDASTAN_MIMIC_DOMAIN") {
            self.otls_ws.mimic_domain = domain;
        }

        Ok(())
    }

    /// Check the configuration for values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        parse_addr("server.tcp_listen_addr", &self.server.tcp_listen_addr)?;
        parse_addr("server.udp_listen_addr", &self.server.udp_listen_addr)?;

        if self.server.max_connections == 0 {
            return Err(CoreError::configuration(
                "server.max_connections must be greater than zero",
            ));
        }

        if self.server.enabled_protocols.is_empty() {
            return Err(CoreError::configuration(
                "server.enabled_protocols must name at least one protocol",
            ));
        }

        if !self.otls_ws.path.starts_with('/') {
            return Err(CoreError::configuration(format!(
                "otls_ws.path must start with '/', got {}",
                self.otls_ws.path
            )));
        }

        if self.otls_ws.mimic_domain.trim().is_empty() {
            return Err(CoreError::configuration("otls_ws.mimic_domain is empty"));
        }

        if !(0.0..=1.0).contains(&self.obfuscation.mimicry_probability) {
            return Err(CoreError::configuration(format!(
                "obfuscation.mimicry_probability must be within 0.0..=1.0, got {}",
                self.obfuscation.mimicry_probability
            )));
        }

        if self.obfuscation.max_padding > 255 {
            return Err(CoreError::configuration(
                "obfuscation.max_padding must not exceed 255",
            ));
        }

        if self.kill_switch.heartbeat_timeout_ms <= self.kill_switch.check_interval_ms {
            return Err(CoreError::configuration(
                "kill_switch.heartbeat_timeout_ms must be greater than check_interval_ms",
            ));
        }

        for (name, upstream) in [
            ("otls_ws.upstream", &self.otls_ws.upstream),
            ("aoquic.upstream", &self.aoquic.upstream),
        ] {
            if let Some(upstream) = upstream {
                validate_host_port(name, upstream)?;
            }
        }

        Ok(())
    }

    /// A sample configuration with every section filled in
    pub fn sample() -> Self {
        Self {
            server: ServerConfig {
                authorized_users: vec![Uuid::new_v4()],
                ..ServerConfig::default()
            },
            otls_ws: OtlsWsConfig {
                upstream: Some("127.0.0.1:1080".to_string()),
                ..OtlsWsConfig::default()
            },
            aoquic: AoQuicConfig {
                upstream: Some("127.0.0.1:5353".to_string()),
                ..AoQuicConfig::default()
            },
            obfuscation: ObfuscationConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value.parse().map_err(|e| {
        CoreError::configuration(format!("{} is not a socket address ({}): {}", name, value, e))
    })
}

fn validate_host_port(name: &str, value: &str) -> Result<()> {
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(CoreError::configuration(format!(
            "{} must be host:port, got {}",
            name, value
        ))),
    }
}
