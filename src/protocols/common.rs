//! Types shared by the obfuscated protocols, the server and the client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Obfuscated protocols supported by HezarDastan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Obfuscated TLS over WebSocket
    #[serde(rename = "otls-ws")]
    OtlsWs,
    /// Adaptive Obfuscated QUIC
    #[serde(rename = "aoquic")]
    AoQuic,
}

/// Socket type a protocol runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "TCP",
            TransportKind::Udp => "UDP",
        }
    }
}

impl ProtocolType {
    /// Canonical string form used in configs and tunnel descriptors
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::OtlsWs => "otls-ws",
            ProtocolType::AoQuic => "aoquic",
        }
    }

    /// Transport the protocol is carried over
    pub fn transport(&self) -> TransportKind {
        match self {
            ProtocolType::OtlsWs => TransportKind::Tcp,
            ProtocolType::AoQuic => TransportKind::Udp,
        }
    }
}

impl FromStr for ProtocolType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "otls-ws" => Ok(ProtocolType::OtlsWs),
            "aoquic" => Ok(ProtocolType::AoQuic),
            other => Err(CoreError::configuration(format!(
                "Unknown protocol type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a single tunnel, as handed from a panel or client to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Server host name or IP address
    pub server_address: String,
    /// Server port
    pub server_port: u16,
    /// Identifier of the user owning the tunnel
    pub user_id: Uuid,
    /// Protocol to use
    pub protocol_type: ProtocolType,
    /// Protocol specific parameters (e.g. `path` for OTLS/WS)
    #[serde(default)]
    pub protocol_params: HashMap<String, String>,
    /// Whether the kill switch guards this tunnel
    #[serde(default)]
    pub enable_kill_switch: bool,
    /// Domain the traffic imitates
    pub mimic_domain: String,
}

impl TunnelConfig {
    pub fn new<S: Into<String>>(
        server_address: S,
        server_port: u16,
        user_id: Uuid,
        protocol_type: ProtocolType,
        mimic_domain: S,
    ) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
            user_id,
            protocol_type,
            protocol_params: HashMap::new(),
            enable_kill_switch: false,
            mimic_domain: mimic_domain.into(),
        }
    }

    /// Add a protocol parameter
    pub fn with_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.protocol_params.insert(key.into(), value.into());
        self
    }

    /// Enable or disable the kill switch
    pub fn with_kill_switch(mut self, enabled: bool) -> Self {
        self.enable_kill_switch = enabled;
        self
    }

    /// Look up a protocol parameter
    pub fn param(&self, key: &str) -> Option<&str> {
        self.protocol_params.get(key).map(String::as_str)
    }

    /// `address:port` of the server
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_address.trim().is_empty() {
            return Err(CoreError::configuration("Tunnel server address is empty"));
        }
        if self.server_port == 0 {
            return Err(CoreError::configuration("Tunnel server port must be non-zero"));
        }
        if self.mimic_domain.trim().is_empty() {
            return Err(CoreError::configuration("Tunnel mimic domain is empty"));
        }
        Ok(())
    }
}

/// A data packet with optional metadata, passed between a protocol handler
/// and its relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Optional metadata, e.g. peer address or connection id
    pub metadata: Option<HashMap<String, String>>,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet {
            data,
            metadata: None,
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_type_parsing() {
        assert_eq!("otls-ws".parse::<ProtocolType>().unwrap(), ProtocolType::OtlsWs);
        assert_eq!("AOQUIC".parse::<ProtocolType>().unwrap(), ProtocolType::AoQuic);
        assert!("vmess".parse::<ProtocolType>().is_err());
        assert_eq!(ProtocolType::OtlsWs.to_string(), "otls-ws");
        assert_eq!(ProtocolType::AoQuic.transport(), TransportKind::Udp);
    }

    #[test]
    fn test_protocol_type_serde_names() {
        let yaml = serde_yaml::to_string(&vec![ProtocolType::OtlsWs, ProtocolType::AoQuic]).unwrap();
        assert!(yaml.contains("otls-ws"));
        assert!(yaml.contains("aoquic"));
    }

    #[test]
    fn test_tunnel_config_validation() {
        let config = TunnelConfig::new(
            "127.0.0.1",
            8443,
            Uuid::new_v4(),
            ProtocolType::OtlsWs,
            "www.google.com",
        )
        .with_param("path", "/stream");

        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint(), "127.0.0.1:8443");
        assert_eq!(config.param("path"), Some("/stream"));

        let mut bad = config.clone();
        bad.server_port = 0;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.mimic_domain = " ".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_packet_metadata() {
        let packet = Packet::new(b"payload".to_vec()).with_metadata("peer", "10.0.0.1:5000");
        assert_eq!(packet.metadata("peer"), Some("10.0.0.1:5000"));
        assert_eq!(packet.metadata("missing"), None);
        assert_eq!(packet.len(), 7);
    }
}
