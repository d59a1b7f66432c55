//! Obfuscated protocols served by HezarDastan Core.

pub mod aoquic;
pub mod common;
pub mod otls_ws;

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use uuid::Uuid;

use crate::error::Result;
use crate::security::{KillSwitchManager, Obfuscator};

pub use aoquic::AoQuicProtocol;
pub use common::{Packet, ProtocolType, TransportKind, TunnelConfig};
pub use otls_ws::OtlsWsProtocol;

/// Common interface for all obfuscated protocols
#[async_trait]
pub trait ObfuscatedProtocol: Send + Sync {
    /// Protocol name (e.g. "OTLS/WS", "AOQUIC")
    fn name(&self) -> &'static str;

    fn protocol_type(&self) -> ProtocolType;

    /// Handle an incoming TCP stream for connection-oriented protocols
    async fn handle_tcp_stream(&self, stream: TcpStream) -> Result<()>;

    /// Handle an incoming UDP datagram for connectionless protocols
    async fn handle_udp_packet(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        peer_addr: SocketAddr,
    ) -> Result<()>;
}

/// State every protocol handler shares
#[derive(Clone)]
pub struct ProtocolContext {
    pub obfuscator: Arc<Obfuscator>,
    pub kill_switch: KillSwitchManager,
    authorized_users: Arc<HashSet<Uuid>>,
}

impl ProtocolContext {
    pub fn new<I>(obfuscator: Arc<Obfuscator>, kill_switch: KillSwitchManager, authorized_users: I) -> Self
    where
        I: IntoIterator<Item = Uuid>,
    {
        Self {
            obfuscator,
            kill_switch,
            authorized_users: Arc::new(authorized_users.into_iter().collect()),
        }
    }

    /// An empty allow-list admits every user
    pub fn is_authorized(&self, user_id: &Uuid) -> bool {
        self.authorized_users.is_empty() || self.authorized_users.contains(user_id)
    }

    pub fn requires_auth(&self) -> bool {
        !self.authorized_users.is_empty()
    }
}
