//! Adaptive Obfuscated QUIC (AOQUIC).
//!
//! A datagram protocol shaped like QUIC: every packet starts with a type byte
//! and a 64-bit connection id, so sessions survive client address changes.
//!
//! ```text
//! [type: u8][conn id: u64 BE][body]
//! ```
//!
//! Initial bodies carry the 16-byte user id; Data bodies carry one
//! obfuscation envelope.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ObfuscatedProtocol, Packet, ProtocolContext, ProtocolType, TransportKind};
use crate::config::AoQuicConfig;
use crate::error::{CoreError, Result};
use crate::security::Obfuscator;

/// Type byte plus connection id
pub const HEADER_LEN: usize = 9;

/// AOQUIC packet types. Client types have the high bit clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    Data,
    Close,
    Ping,
    Accept,
    ServerData,
    Pong,
    Reject,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(PacketType::Initial),
            0x02 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::Close),
            0x04 => Ok(PacketType::Ping),
            0x81 => Ok(PacketType::Accept),
            0x82 => Ok(PacketType::ServerData),
            0x84 => Ok(PacketType::Pong),
            0x85 => Ok(PacketType::Reject),
            other => Err(CoreError::protocol_violation(format!(
                "Unknown AOQUIC packet type 0x{:02x}",
                other
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PacketType::Initial => 0x01,
            PacketType::Data => 0x02,
            PacketType::Close => 0x03,
            PacketType::Ping => 0x04,
            PacketType::Accept => 0x81,
            PacketType::ServerData => 0x82,
            PacketType::Pong => 0x84,
            PacketType::Reject => 0x85,
        }
    }

    pub fn is_from_server(self) -> bool {
        self.as_u8() & 0x80 != 0
    }
}

/// A decoded AOQUIC datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AoQuicPacket {
    pub packet_type: PacketType,
    pub conn_id: u64,
    pub body: Vec<u8>,
}

impl AoQuicPacket {
    pub fn new(packet_type: PacketType, conn_id: u64, body: Vec<u8>) -> Self {
        Self {
            packet_type,
            conn_id,
            body,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.push(self.packet_type.as_u8());
        out.extend_from_slice(&self.conn_id.to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(CoreError::protocol_violation(format!(
                "AOQUIC datagram too short: {} bytes",
                datagram.len()
            )));
        }

        let packet_type = PacketType::from_u8(datagram[0])?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&datagram[1..HEADER_LEN]);

        Ok(Self {
            packet_type,
            conn_id: u64::from_be_bytes(id),
            body: datagram[HEADER_LEN..].to_vec(),
        })
    }
}

struct Session {
    peer: SocketAddr,
    user_id: Uuid,
    last_seen: Instant,
    upstream: Option<Arc<UdpSocket>>,
    relay_task: Option<JoinHandle<()>>,
    _slot: OwnedSemaphorePermit,
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
    }
}

/// Server side of the AOQUIC protocol
pub struct AoQuicProtocol {
    config: AoQuicConfig,
    ctx: ProtocolContext,
    sessions: Arc<DashMap<u64, Session>>,
    slots: Arc<Semaphore>,
    reply_socket: OnceLock<Arc<UdpSocket>>,
}

impl AoQuicProtocol {
    pub fn new(config: AoQuicConfig, ctx: ProtocolContext) -> Self {
        info!(
            max_sessions = config.max_sessions,
            upstream = ?config.upstream,
            "Initializing AOQUIC protocol"
        );

        let slots = Arc::new(Semaphore::new(config.max_sessions));

        Self {
            config,
            ctx,
            sessions: Arc::new(DashMap::new()),
            slots,
            reply_socket: OnceLock::new(),
        }
    }

    /// Give the protocol the listening socket so upstream replies can be
    /// sent back from the server port.
    pub fn attach_socket(&self, socket: Arc<UdpSocket>) {
        if self.reply_socket.set(socket).is_err() {
            debug!("AOQUIC reply socket already attached");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, conn_id: u64) -> bool {
        self.sessions.contains_key(&conn_id)
    }

    /// Drop sessions idle for longer than the configured timeout; returns how
    /// many were removed
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.config.session_idle_timeout();
        let before = self.sessions.len();

        self.sessions.retain(|conn_id, session| {
            let keep = now.saturating_duration_since(session.last_seen) <= idle_timeout;
            if !keep {
                debug!(conn_id, user_id = %session.user_id, "Dropping idle AOQUIC session");
            }
            keep
        });

        before.saturating_sub(self.sessions.len())
    }

    /// Sweep idle sessions every `interval` until `shutdown` flips to true
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if interval.is_zero() {
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_idle(Instant::now());
                    if removed > 0 {
                        info!("Swept {} idle AOQUIC sessions", removed);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.sessions.clear();
        debug!("AOQUIC sweeper stopped");
    }

    async fn send(
        &self,
        socket: &UdpSocket,
        packet_type: PacketType,
        conn_id: u64,
        body: Vec<u8>,
        peer: SocketAddr,
    ) -> Result<()> {
        let packet = AoQuicPacket::new(packet_type, conn_id, body);
        socket.send_to(&packet.encode(), peer).await?;
        Ok(())
    }

    async fn handle_initial(
        &self,
        socket: &UdpSocket,
        packet: AoQuicPacket,
        peer: SocketAddr,
    ) -> Result<()> {
        let conn_id = packet.conn_id;
        let user_id = Uuid::from_slice(&packet.body).map_err(|_| {
            CoreError::protocol_violation(format!(
                "AOQUIC Initial body must be a 16-byte user id, got {} bytes",
                packet.body.len()
            ))
        })?;

        // A retransmitted Initial: the Accept may have been lost
        let existing = self.sessions.get_mut(&conn_id).map(|mut session| {
            let same_user = session.user_id == user_id;
            if same_user {
                session.peer = peer;
                session.last_seen = Instant::now();
            }
            same_user
        });
        match existing {
            Some(true) => {
                debug!(conn_id, %peer, "Repeated AOQUIC Initial, re-sending Accept");
                return self
                    .send(socket, PacketType::Accept, conn_id, Vec::new(), peer)
                    .await;
            }
            Some(false) => {
                return Err(CoreError::protocol_violation(format!(
                    "Connection id {} belongs to another user",
                    conn_id
                )));
            }
            None => {}
        }

        if !self.ctx.is_authorized(&user_id) {
            warn!(%user_id, %peer, "AOQUIC user is not authorized");
            self.send(socket, PacketType::Reject, conn_id, Vec::new(), peer)
                .await?;
            return Err(CoreError::unauthorized(format!(
                "User {} is not authorized",
                user_id
            )));
        }

        // Each session holds one permit until it is dropped
        let slot = match self.slots.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                warn!(%peer, "AOQUIC session limit reached");
                self.send(socket, PacketType::Reject, conn_id, Vec::new(), peer)
                    .await?;
                return Err(CoreError::other(format!(
                    "AOQUIC session limit of {} reached",
                    self.config.max_sessions
                )));
            }
        };

        let (upstream, relay_task) = match &self.config.upstream {
            Some(addr) => {
                let (upstream, task) = self.open_upstream(addr, conn_id).await?;
                (Some(upstream), task)
            }
            None => (None, None),
        };

        let session = Session {
            peer,
            user_id,
            last_seen: Instant::now(),
            upstream,
            relay_task,
            _slot: slot,
        };

        match self.sessions.entry(conn_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(session);
            }
            // Another Initial for this id won the race; dropping ours releases
            // its slot and relay task
            Entry::Occupied(occupied) => {
                if occupied.get().user_id != user_id {
                    return Err(CoreError::protocol_violation(format!(
                        "Connection id {} belongs to another user",
                        conn_id
                    )));
                }
                debug!(conn_id, %peer, "Concurrent AOQUIC Initial, keeping first session");
            }
        }

        self.ctx.kill_switch.record_heartbeat();
        info!(conn_id, %user_id, %peer, "AOQUIC session established");

        self.send(socket, PacketType::Accept, conn_id, Vec::new(), peer)
            .await
    }

    async fn open_upstream(
        &self,
        addr: &str,
        conn_id: u64,
    ) -> Result<(Arc<UdpSocket>, Option<JoinHandle<()>>)> {
        let upstream = UdpSocket::bind("0.0.0.0:0").await?;
        upstream.connect(addr).await.map_err(|e| {
            error!(upstream = %addr, "Failed to reach upstream: {}", e);
            CoreError::Io(e)
        })?;
        let upstream = Arc::new(upstream);

        let relay_task = match self.reply_socket.get() {
            Some(reply_socket) => Some(tokio::spawn(relay_replies(
                conn_id,
                upstream.clone(),
                reply_socket.clone(),
                self.sessions.clone(),
                self.ctx.obfuscator.clone(),
                self.config.max_datagram_size,
            ))),
            None => {
                warn!(conn_id, "No reply socket attached, upstream replies will be dropped");
                None
            }
        };

        Ok((upstream, relay_task))
    }

    /// Refresh a session for an incoming packet. Returns its upstream socket.
    fn touch_session(&self, conn_id: u64, peer: SocketAddr) -> Result<Option<Arc<UdpSocket>>> {
        let mut session = self.sessions.get_mut(&conn_id).ok_or_else(|| {
            CoreError::protocol_violation(format!("Unknown AOQUIC connection id {}", conn_id))
        })?;

        if session.peer != peer {
            warn!(
                conn_id,
                old_peer = %session.peer,
                new_peer = %peer,
                "AOQUIC peer address migrated"
            );
            session.peer = peer;
        }
        session.last_seen = Instant::now();

        Ok(session.upstream.clone())
    }

    async fn handle_data(
        &self,
        socket: &UdpSocket,
        packet: AoQuicPacket,
        peer: SocketAddr,
    ) -> Result<()> {
        let upstream = self.touch_session(packet.conn_id, peer)?;
        let payload = Packet::new(self.ctx.obfuscator.deobfuscate_data(&packet.body)?)
            .with_metadata("peer", peer.to_string());
        self.ctx.kill_switch.record_heartbeat();

        match upstream {
            Some(upstream) => {
                debug!(
                    conn_id = packet.conn_id,
                    bytes = payload.len(),
                    peer = payload.metadata("peer").unwrap_or_default(),
                    "Relaying datagram upstream"
                );
                upstream.send(&payload.data).await?;
            }
            None => {
                let envelope = self.ctx.obfuscator.obfuscate_data(&payload.data).await?;
                self.send(socket, PacketType::ServerData, packet.conn_id, envelope, peer)
                    .await?;
            }
        }

        Ok(())
    }
}

async fn relay_replies(
    conn_id: u64,
    upstream: Arc<UdpSocket>,
    reply_socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<u64, Session>>,
    obfuscator: Arc<Obfuscator>,
    max_datagram_size: usize,
) {
    let mut buf = vec![0u8; max_datagram_size];

    loop {
        let n = match upstream.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(conn_id, "Upstream receive failed: {}", e);
                break;
            }
        };

        let Some(peer) = sessions.get(&conn_id).map(|session| session.peer) else {
            break;
        };

        let envelope = match obfuscator.obfuscate_data(&buf[..n]).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id, "Failed to obfuscate upstream reply: {}", e);
                continue;
            }
        };

        let packet = AoQuicPacket::new(PacketType::ServerData, conn_id, envelope);
        if let Err(e) = reply_socket.send_to(&packet.encode(), peer).await {
            warn!(conn_id, %peer, "Failed to send upstream reply: {}", e);
        }
    }
}

#[async_trait]
impl ObfuscatedProtocol for AoQuicProtocol {
    fn name(&self) -> &'static str {
        "AOQUIC"
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::AoQuic
    }

    async fn handle_tcp_stream(&self, stream: TcpStream) -> Result<()> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        error!(
            "AOQUIC: received unexpected TCP stream from {}. This protocol is UDP-based.",
            peer
        );
        Err(CoreError::UnsupportedTransport {
            protocol: self.name(),
            transport: TransportKind::Tcp.as_str(),
        })
    }

    async fn handle_udp_packet(
        &self,
        socket: &UdpSocket,
        buf: &[u8],
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let packet = AoQuicPacket::decode(buf)?;
        debug!(
            peer = %peer_addr,
            conn_id = packet.conn_id,
            packet_type = ?packet.packet_type,
            "AOQUIC: handling datagram"
        );

        match packet.packet_type {
            PacketType::Initial => self.handle_initial(socket, packet, peer_addr).await,
            PacketType::Data => self.handle_data(socket, packet, peer_addr).await,
            PacketType::Ping => {
                self.touch_session(packet.conn_id, peer_addr)?;
                self.ctx.kill_switch.record_heartbeat();
                self.send(socket, PacketType::Pong, packet.conn_id, Vec::new(), peer_addr)
                    .await
            }
            PacketType::Close => {
                if let Some((conn_id, session)) = self.sessions.remove(&packet.conn_id) {
                    info!(conn_id, user_id = %session.user_id, "AOQUIC session closed by peer");
                }
                Ok(())
            }
            server_type => Err(CoreError::protocol_violation(format!(
                "Client sent server-only packet type {:?}",
                server_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObfuscationConfig;
    use crate::security::KillSwitchManager;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn context(users: Vec<Uuid>) -> ProtocolContext {
        let obfuscation = ObfuscationConfig {
            max_jitter_ms: 0,
            ..ObfuscationConfig::default()
        };
        ProtocolContext::new(
            Arc::new(Obfuscator::new(obfuscation, "www.example.com")),
            KillSwitchManager::new(true),
            users,
        )
    }

    struct Harness {
        protocol: Arc<AoQuicProtocol>,
        server: Arc<UdpSocket>,
        client: UdpSocket,
    }

    impl Harness {
        async fn new(config: AoQuicConfig, ctx: ProtocolContext) -> Self {
            let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            client.connect(server.local_addr().unwrap()).await.unwrap();

            let protocol = Arc::new(AoQuicProtocol::new(config, ctx));
            protocol.attach_socket(server.clone());

            Self {
                protocol,
                server,
                client,
            }
        }

        /// Deliver one client packet to the protocol
        async fn deliver(&self, packet: AoQuicPacket) -> Result<()> {
            self.client.send(&packet.encode()).await.unwrap();
            let mut buf = vec![0u8; 65_535];
            let (n, peer) = self.server.recv_from(&mut buf).await.unwrap();
            self.protocol
                .handle_udp_packet(&self.server, &buf[..n], peer)
                .await
        }

        async fn reply(&self) -> AoQuicPacket {
            let mut buf = vec![0u8; 65_535];
            let n = timeout(Duration::from_secs(2), self.client.recv(&mut buf))
                .await
                .expect("no reply from server")
                .unwrap();
            AoQuicPacket::decode(&buf[..n]).unwrap()
        }
    }

    fn initial(conn_id: u64, user_id: Uuid) -> AoQuicPacket {
        AoQuicPacket::new(PacketType::Initial, conn_id, user_id.as_bytes().to_vec())
    }

    #[test]
    fn test_packet_decode_rejects_garbage() {
        assert!(matches!(
            AoQuicPacket::decode(&[0x01, 0, 0]),
            Err(CoreError::ProtocolViolation(_))
        ));
        assert!(matches!(
            AoQuicPacket::decode(&[0x7f, 0, 0, 0, 0, 0, 0, 0, 1]),
            Err(CoreError::ProtocolViolation(_))
        ));

        let packet = AoQuicPacket::new(PacketType::Ping, 0xDEAD_BEEF, b"hb".to_vec());
        let encoded = packet.encode();
        assert_eq!(encoded[0], 0x04);
        assert_eq!(AoQuicPacket::decode(&encoded).unwrap(), packet);
        assert!(PacketType::Reject.is_from_server());
        assert!(!PacketType::Data.is_from_server());
    }

    #[tokio::test]
    async fn test_session_lifecycle_with_echo() {
        let ctx = context(Vec::new());
        let obfuscator = ctx.obfuscator.clone();
        let h = Harness::new(AoQuicConfig::default(), ctx).await;
        let conn_id = 42;

        h.deliver(initial(conn_id, Uuid::new_v4())).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);
        assert!(h.protocol.has_session(conn_id));

        let envelope = obfuscator.obfuscate_data(b"datagram payload").await.unwrap();
        h.deliver(AoQuicPacket::new(PacketType::Data, conn_id, envelope))
            .await
            .unwrap();
        let reply = h.reply().await;
        assert_eq!(reply.packet_type, PacketType::ServerData);
        assert_eq!(reply.conn_id, conn_id);
        assert_eq!(
            obfuscator.deobfuscate_data(&reply.body).unwrap(),
            b"datagram payload"
        );

        h.deliver(AoQuicPacket::new(PacketType::Ping, conn_id, b"p1".to_vec()))
            .await
            .unwrap();
        let pong = h.reply().await;
        assert_eq!(pong.packet_type, PacketType::Pong);
        assert!(pong.body.is_empty());

        h.deliver(AoQuicPacket::new(PacketType::Close, conn_id, Vec::new()))
            .await
            .unwrap();
        assert_eq!(h.protocol.session_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_initial_resends_accept() {
        let h = Harness::new(AoQuicConfig::default(), context(Vec::new())).await;
        let user = Uuid::new_v4();

        h.deliver(initial(7, user)).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);
        h.deliver(initial(7, user)).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);
        assert_eq!(h.protocol.session_count(), 1);

        let result = h.deliver(initial(7, Uuid::new_v4())).await;
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_data_without_session_is_violation() {
        let h = Harness::new(AoQuicConfig::default(), context(Vec::new())).await;
        let result = h
            .deliver(AoQuicPacket::new(PacketType::Data, 99, vec![0, 0, 0, 0]))
            .await;
        assert!(matches!(result, Err(CoreError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_unauthorized_user_gets_reject() {
        let h = Harness::new(AoQuicConfig::default(), context(vec![Uuid::new_v4()])).await;

        let result = h.deliver(initial(1, Uuid::new_v4())).await;
        assert!(matches!(result, Err(CoreError::Unauthorized(_))));
        assert_eq!(h.reply().await.packet_type, PacketType::Reject);
        assert_eq!(h.protocol.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = AoQuicConfig {
            max_sessions: 1,
            ..AoQuicConfig::default()
        };
        let h = Harness::new(config, context(Vec::new())).await;

        h.deliver(initial(1, Uuid::new_v4())).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);

        assert!(h.deliver(initial(2, Uuid::new_v4())).await.is_err());
        assert_eq!(h.reply().await.packet_type, PacketType::Reject);

        // Closing the first session frees its slot
        h.deliver(AoQuicPacket::new(PacketType::Close, 1, Vec::new()))
            .await
            .unwrap();
        h.deliver(initial(3, Uuid::new_v4())).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);
    }

    #[tokio::test]
    async fn test_concurrent_initials_respect_limit() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = AoQuicConfig {
            max_sessions: 1,
            upstream: Some(upstream.local_addr().unwrap().to_string()),
            ..AoQuicConfig::default()
        };
        let h = Harness::new(config, context(Vec::new())).await;
        let peer = h.client.local_addr().unwrap();

        let mut tasks = Vec::new();
        for conn_id in 0..20u64 {
            let protocol = h.protocol.clone();
            let server = h.server.clone();
            // Initials arrive in pairs per connection id
            let datagram = initial(conn_id % 10, Uuid::from_u128(conn_id as u128 % 10)).encode();
            tasks.push(tokio::spawn(async move {
                protocol.handle_udp_packet(&server, &datagram, peer).await
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                accepted += 1;
            }
        }

        assert_eq!(h.protocol.session_count(), 1);
        assert!((1..=2).contains(&accepted), "{} Initials accepted", accepted);
    }

    #[tokio::test]
    async fn test_session_follows_migrated_peer() {
        let ctx = context(Vec::new());
        let obfuscator = ctx.obfuscator.clone();
        let h = Harness::new(AoQuicConfig::default(), ctx).await;
        let conn_id = 7;

        h.deliver(initial(conn_id, Uuid::new_v4())).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);

        // Same connection id from a new address
        let moved = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        moved.connect(h.server.local_addr().unwrap()).await.unwrap();
        let envelope = obfuscator.obfuscate_data(b"after migration").await.unwrap();
        moved
            .send(&AoQuicPacket::new(PacketType::Data, conn_id, envelope).encode())
            .await
            .unwrap();

        let mut buf = vec![0u8; 65_535];
        let (n, peer) = h.server.recv_from(&mut buf).await.unwrap();
        assert_eq!(peer, moved.local_addr().unwrap());
        h.protocol
            .handle_udp_packet(&h.server, &buf[..n], peer)
            .await
            .unwrap();

        let n = timeout(Duration::from_secs(2), moved.recv(&mut buf))
            .await
            .expect("reply did not follow the new address")
            .unwrap();
        let reply = AoQuicPacket::decode(&buf[..n]).unwrap();
        assert_eq!(reply.packet_type, PacketType::ServerData);
        assert_eq!(
            obfuscator.deobfuscate_data(&reply.body).unwrap(),
            b"after migration"
        );
    }

    #[tokio::test]
    async fn test_sweep_idle_sessions() {
        let config = AoQuicConfig {
            session_idle_timeout_ms: 1_000,
            ..AoQuicConfig::default()
        };
        let h = Harness::new(config, context(Vec::new())).await;

        h.deliver(initial(5, Uuid::new_v4())).await.unwrap();
        h.reply().await;

        assert_eq!(h.protocol.sweep_idle(Instant::now()), 0);
        assert_eq!(
            h.protocol
                .sweep_idle(Instant::now() + Duration::from_secs(5)),
            1
        );
        assert!(!h.protocol.has_session(5));
    }

    #[tokio::test]
    async fn test_data_relayed_to_upstream() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = AoQuicConfig {
            upstream: Some(upstream.local_addr().unwrap().to_string()),
            ..AoQuicConfig::default()
        };
        let ctx = context(Vec::new());
        let obfuscator = ctx.obfuscator.clone();
        let h = Harness::new(config, ctx).await;

        h.deliver(initial(11, Uuid::new_v4())).await.unwrap();
        assert_eq!(h.reply().await.packet_type, PacketType::Accept);

        let envelope = obfuscator.obfuscate_data(b"query").await.unwrap();
        h.deliver(AoQuicPacket::new(PacketType::Data, 11, envelope))
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (n, from) = upstream.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");

        upstream.send_to(b"answer", from).await.unwrap();
        let reply = h.reply().await;
        assert_eq!(reply.packet_type, PacketType::ServerData);
        assert_eq!(obfuscator.deobfuscate_data(&reply.body).unwrap(), b"answer");
    }

    #[tokio::test]
    async fn test_aoquic_rejects_tcp_streams() {
        let protocol = AoQuicProtocol::new(AoQuicConfig::default(), context(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let err = protocol.handle_tcp_stream(stream).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedTransport {
                protocol: "AOQUIC",
                transport: "TCP"
            }
        ));
    }
}
