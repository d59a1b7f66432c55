//! Client side of the tunnel: connect to a HezarDastan server over either
//! protocol and exchange raw payloads.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ObfuscationConfig;
use crate::error::{CoreError, Result};
use crate::protocols::aoquic::{AoQuicPacket, PacketType};
use crate::protocols::otls_ws::ws_config;
use crate::protocols::{ProtocolType, TunnelConfig};
use crate::security::{KillSwitchManager, KillSwitchState, Obfuscator};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const INITIAL_ATTEMPTS: usize = 3;
const MAX_FRAME_SIZE: usize = 1024 * 1024;
const MAX_DATAGRAM_SIZE: usize = 65_535;
const DEFAULT_WS_PATH: &str = "/ws";
const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// An established tunnel
#[async_trait]
pub trait TunnelSession: Send {
    fn protocol_type(&self) -> ProtocolType;

    /// Kill switch fed by this session, when enabled
    fn kill_switch(&self) -> Option<KillSwitchManager>;

    /// Obfuscate and send one payload
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Wait for the next payload from the server
    async fn recv(&mut self) -> Result<Vec<u8>>;

    async fn close(&mut self) -> Result<()>;
}

/// Entry point for opening tunnels
pub struct TunnelClient;

impl TunnelClient {
    pub async fn connect(
        config: &TunnelConfig,
        obfuscation: ObfuscationConfig,
    ) -> Result<Box<dyn TunnelSession>> {
        config.validate()?;

        let obfuscator = Arc::new(Obfuscator::new(obfuscation, config.mimic_domain.clone()));
        let kill_switch = config
            .enable_kill_switch
            .then(|| KillSwitchManager::new(true));

        info!(
            endpoint = %config.endpoint(),
            protocol = %config.protocol_type,
            transport = config.protocol_type.transport().as_str(),
            "Opening tunnel"
        );

        match config.protocol_type {
            ProtocolType::OtlsWs => Ok(Box::new(
                OtlsWsSession::connect(config, obfuscator, kill_switch).await?,
            )),
            ProtocolType::AoQuic => Ok(Box::new(
                AoQuicSession::connect(config, obfuscator, kill_switch).await?,
            )),
        }
    }
}

fn closed_error(protocol: &str) -> CoreError {
    CoreError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        format!("{} tunnel is closed", protocol),
    ))
}

fn trigger(kill_switch: &Option<KillSwitchManager>) {
    if let Some(kill_switch) = kill_switch {
        kill_switch.set_state(KillSwitchState::Triggered);
    }
}

/// The upgrade request an OTLS/WS client sends: the path from
/// `protocol_params["path"]`, Host set to the mimic domain and the user id in
/// the `sid` cookie.
pub fn upgrade_request(config: &TunnelConfig) -> Result<Request> {
    let url = format!(
        "ws://{}{}",
        config.mimic_domain,
        config.param("path").unwrap_or(DEFAULT_WS_PATH)
    );
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| CoreError::configuration(format!("Invalid tunnel URL {}: {}", url, e)))?;

    let cookie = HeaderValue::from_str(&format!("sid={}", config.user_id))
        .map_err(|e| CoreError::configuration(format!("Invalid session cookie: {}", e)))?;
    let headers = request.headers_mut();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(COOKIE, cookie);

    Ok(request)
}

/// OTLS/WS tunnel over a TCP stream
pub struct OtlsWsSession {
    ws: WebSocketStream<TcpStream>,
    obfuscator: Arc<Obfuscator>,
    kill_switch: Option<KillSwitchManager>,
    closed: bool,
}

impl OtlsWsSession {
    pub async fn connect(
        config: &TunnelConfig,
        obfuscator: Arc<Obfuscator>,
        kill_switch: Option<KillSwitchManager>,
    ) -> Result<Self> {
        let request = upgrade_request(config)?;

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(config.endpoint()))
            .await
            .map_err(|_| CoreError::timeout(CONNECT_TIMEOUT.as_millis() as u64))??;
        stream.set_nodelay(true)?;

        let handshake =
            client_async_with_config(request, stream, Some(ws_config(MAX_FRAME_SIZE)));
        let (ws, _response) = match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(upgraded)) => upgraded,
            Ok(Err(WsError::Http(response))) => {
                return Err(CoreError::handshake(format!(
                    "Server refused the upgrade: {}",
                    response.status()
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(CoreError::timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)),
        };

        info!(endpoint = %config.endpoint(), "OTLS/WS tunnel established");

        Ok(Self {
            ws,
            obfuscator,
            kill_switch,
            closed: false,
        })
    }

    fn mark_lost(&mut self) {
        self.closed = true;
        trigger(&self.kill_switch);
    }
}

#[async_trait]
impl TunnelSession for OtlsWsSession {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::OtlsWs
    }

    fn kill_switch(&self) -> Option<KillSwitchManager> {
        self.kill_switch.clone()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(closed_error("OTLS/WS"));
        }

        let envelope = self.obfuscator.obfuscate_data(data).await?;
        self.ws.send(Message::Binary(envelope)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(closed_error("OTLS/WS"));
        }

        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    self.mark_lost();
                    return Err(e.into());
                }
                None => {
                    self.mark_lost();
                    return Err(closed_error("OTLS/WS"));
                }
            };

            match message {
                Message::Binary(payload) => {
                    let data = self.obfuscator.deobfuscate_data(&payload)?;
                    if let Some(kill_switch) = &self.kill_switch {
                        kill_switch.record_heartbeat();
                    }
                    return Ok(data);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    debug!(?frame, "OTLS/WS server closed the tunnel");
                    self.mark_lost();
                    // Flush the close reply queued by the codec
                    let _ = self.ws.close(None).await;
                    return Err(closed_error("OTLS/WS"));
                }
                Message::Text(_) => {
                    return Err(CoreError::protocol_violation(
                        "Unexpected text message from server",
                    ));
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.ws.close(None).await?;

        // Drain until the server acknowledges
        let drain = async { while let Some(Ok(_)) = self.ws.next().await {} };
        if timeout(HANDSHAKE_TIMEOUT, drain).await.is_err() {
            warn!("OTLS/WS server did not acknowledge close");
        }

        Ok(())
    }
}

/// AOQUIC tunnel over a connected UDP socket
pub struct AoQuicSession {
    socket: UdpSocket,
    conn_id: u64,
    obfuscator: Arc<Obfuscator>,
    kill_switch: Option<KillSwitchManager>,
    closed: bool,
}

impl AoQuicSession {
    pub async fn connect(
        config: &TunnelConfig,
        obfuscator: Arc<Obfuscator>,
        kill_switch: Option<KillSwitchManager>,
    ) -> Result<Self> {
        let server: SocketAddr = lookup_host(config.endpoint())
            .await?
            .next()
            .ok_or_else(|| {
                CoreError::configuration(format!("Cannot resolve {}", config.endpoint()))
            })?;

        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;

        let conn_id: u64 = rand::thread_rng().gen();
        let initial = AoQuicPacket::new(
            PacketType::Initial,
            conn_id,
            config.user_id.as_bytes().to_vec(),
        )
        .encode();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        for attempt in 1..=INITIAL_ATTEMPTS {
            socket.send(&initial).await?;

            let reply = timeout(
                INITIAL_RETRY_INTERVAL,
                handshake_reply(&socket, &mut buf, conn_id),
            )
            .await;

            match reply {
                Ok(Ok(PacketType::Accept)) => {
                    info!(%server, conn_id, "AOQUIC tunnel established");
                    return Ok(Self {
                        socket,
                        conn_id,
                        obfuscator,
                        kill_switch,
                        closed: false,
                    });
                }
                Ok(Ok(PacketType::Reject)) => {
                    return Err(CoreError::unauthorized("Server rejected the AOQUIC session"));
                }
                Ok(Ok(other)) => {
                    return Err(CoreError::handshake(format!(
                        "Unexpected {:?} during AOQUIC handshake",
                        other
                    )));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => debug!(attempt, "No AOQUIC Accept yet, retrying"),
            }
        }

        Err(CoreError::timeout(
            INITIAL_RETRY_INTERVAL.as_millis() as u64 * INITIAL_ATTEMPTS as u64,
        ))
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    async fn send_packet(&self, packet_type: PacketType, body: Vec<u8>) -> Result<()> {
        let packet = AoQuicPacket::new(packet_type, self.conn_id, body);
        self.socket.send(&packet.encode()).await?;
        Ok(())
    }
}

/// Wait for the server's answer to an Initial
async fn handshake_reply(socket: &UdpSocket, buf: &mut [u8], conn_id: u64) -> Result<PacketType> {
    loop {
        let n = socket.recv(buf).await?;
        match AoQuicPacket::decode(&buf[..n]) {
            Ok(packet) if packet.conn_id == conn_id => return Ok(packet.packet_type),
            Ok(_) => continue,
            Err(e) => debug!("Ignoring malformed AOQUIC reply: {}", e),
        }
    }
}

#[async_trait]
impl TunnelSession for AoQuicSession {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::AoQuic
    }

    fn kill_switch(&self) -> Option<KillSwitchManager> {
        self.kill_switch.clone()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(closed_error("AOQUIC"));
        }

        let envelope = self.obfuscator.obfuscate_data(data).await?;
        self.send_packet(PacketType::Data, envelope).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(closed_error("AOQUIC"));
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let n = self.socket.recv(&mut buf).await?;
            let packet = match AoQuicPacket::decode(&buf[..n]) {
                Ok(packet) if packet.conn_id == self.conn_id => packet,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Ignoring malformed AOQUIC datagram: {}", e);
                    continue;
                }
            };

            match packet.packet_type {
                PacketType::ServerData => {
                    let data = self.obfuscator.deobfuscate_data(&packet.body)?;
                    if let Some(kill_switch) = &self.kill_switch {
                        kill_switch.record_heartbeat();
                    }
                    return Ok(data);
                }
                PacketType::Reject => {
                    self.closed = true;
                    trigger(&self.kill_switch);
                    return Err(CoreError::unauthorized("Server dropped the AOQUIC session"));
                }
                other => debug!("Ignoring AOQUIC {:?} packet", other),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_packet(PacketType::Close, Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tunnel_config(protocol_type: ProtocolType) -> TunnelConfig {
        TunnelConfig::new(
            "127.0.0.1",
            8443,
            Uuid::nil(),
            protocol_type,
            "www.example.com",
        )
    }

    #[test]
    fn test_upgrade_request_shape() {
        let config = tunnel_config(ProtocolType::OtlsWs).with_param("path", "/stream");
        let request = upgrade_request(&config).unwrap();

        assert_eq!(request.uri().host(), Some("www.example.com"));
        assert_eq!(request.uri().path(), "/stream");
        assert_eq!(
            request.headers().get(COOKIE).unwrap(),
            format!("sid={}", Uuid::nil()).as_str()
        );
        assert!(request
            .headers()
            .get(USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Mozilla/5.0"));
    }

    #[test]
    fn test_default_path() {
        let request = upgrade_request(&tunnel_config(ProtocolType::OtlsWs)).unwrap();
        assert_eq!(request.uri().path(), "/ws");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let mut config = tunnel_config(ProtocolType::AoQuic);
        config.server_port = 0;
        let result = TunnelClient::connect(&config, ObfuscationConfig::default()).await;
        assert!(matches!(result, Err(CoreError::Configuration(_))));
    }
}
