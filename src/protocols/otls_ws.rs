//! Obfuscated TLS over WebSocket (OTLS/WS).
//!
//! To an observer the session is a WebSocket upgrade to the mimic domain
//! followed by binary messages. Each binary message carries one obfuscation
//! envelope. A request that does not look exactly like ours gets the decoy
//! 404 page a plain web server would return.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ObfuscatedProtocol, ProtocolContext, ProtocolType, TransportKind};
use crate::config::OtlsWsConfig;
use crate::error::{CoreError, Result};
use crate::security::Obfuscator;

const MAX_HEAD_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
const RELAY_BUFFER_SIZE: usize = 16 * 1024;
const OUTBOUND_QUEUE: usize = 64;

const DECOY_BODY: &str = "<html>\r\n<head><title>404 Not Found</title></head>\r\n<body>\r\n<center><h1>404 Not Found</h1></center>\r\n<hr><center>nginx</center>\r\n</body>\r\n</html>\r\n";

type WsSink<S> = SplitSink<WebSocketStream<BufReader<S>>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<BufReader<S>>>;

/// Frame and message caps shared by both ends of a tunnel
pub fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_frame_size: Some(max_frame_size),
        max_message_size: Some(max_frame_size),
        ..WebSocketConfig::default()
    }
}

/// Parsed HTTP/1.1 request head (header names lowercased)
#[derive(Debug, Clone)]
pub struct HttpHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    headers: HashMap<String, String>,
}

impl HttpHead {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut slots);

        match request.parse(raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(CoreError::handshake("Incomplete HTTP head"))
            }
            Err(e) => return Err(CoreError::handshake(format!("Malformed HTTP head: {}", e))),
        }

        let mut headers = HashMap::new();
        for header in request.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| CoreError::handshake(format!("Non-text {} header", header.name)))?;
            headers.insert(header.name.to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            method: request.method.unwrap_or_default().to_string(),
            target: request.path.unwrap_or_default().to_string(),
            version: request.version.unwrap_or_default(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Whether a comma separated header contains `token` (case-insensitive)
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|value| {
                value
                    .split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    /// Value of a cookie from the `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }
}

/// Read raw bytes up to and including the blank line ending an HTTP head.
/// Never buffers more than 8 KiB.
pub async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut limited = reader.take(MAX_HEAD_SIZE as u64);

    loop {
        let read = limited.read_until(b'\n', &mut head).await?;
        if read == 0 {
            return Err(if head.len() >= MAX_HEAD_SIZE {
                CoreError::handshake("HTTP head exceeds 8 KiB")
            } else {
                CoreError::handshake("Connection closed during handshake")
            });
        }

        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
    }
}

/// Last time anything crossed the tunnel in either direction
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

fn close_message(code: CloseCode) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    }))
}

/// Server side of the OTLS/WS protocol
pub struct OtlsWsProtocol {
    config: OtlsWsConfig,
    idle_timeout: Duration,
    ctx: ProtocolContext,
}

impl OtlsWsProtocol {
    pub fn new(config: OtlsWsConfig, idle_timeout: Duration, ctx: ProtocolContext) -> Self {
        info!(
            path = %config.path,
            mimic_domain = %config.mimic_domain,
            upstream = ?config.upstream,
            "Initializing OTLS/WS protocol"
        );

        Self {
            config,
            idle_timeout,
            ctx,
        }
    }

    /// Serve one connection: handshake, then messages until close
    pub async fn serve<S>(&self, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stream = BufReader::new(stream);

        let deadline = Duration::from_millis(self.config.handshake_timeout_ms);
        match timeout(deadline, self.handshake(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(%peer, "OTLS/WS handshake timed out");
                return Err(CoreError::timeout(self.config.handshake_timeout_ms));
            }
        }

        let ws = WebSocketStream::from_raw_socket(
            stream,
            Role::Server,
            Some(ws_config(self.config.max_frame_size)),
        )
        .await;
        info!(%peer, "OTLS/WS session established");

        match self.run_session(ws, peer).await {
            Err(e) if e.is_disconnect() => {
                debug!(%peer, "OTLS/WS peer disconnected: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Answer the upgrade with 101, or with the decoy page on any failure
    async fn handshake<S>(&self, stream: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let validated = match read_head(stream).await {
            Ok(raw) => HttpHead::parse(&raw).and_then(|head| self.validate_upgrade(&head)),
            Err(e) => Err(e),
        };

        match validated {
            Ok(key) => {
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                    derive_accept_key(key.as_bytes())
                );
                stream.write_all(response.as_bytes()).await?;
                stream.flush().await?;
                Ok(())
            }
            Err(e) => {
                debug!("Rejecting OTLS/WS handshake: {}", e);
                let response = format!(
                    "HTTP/1.1 404 Not Found\r\nServer: nginx\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    DECOY_BODY.len(),
                    DECOY_BODY
                );
                if let Err(write_err) = stream.write_all(response.as_bytes()).await {
                    debug!("Could not send decoy page: {}", write_err);
                }
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Check an upgrade request; returns the client key
    fn validate_upgrade(&self, head: &HttpHead) -> Result<String> {
        if head.method != "GET" || head.version != 1 {
            return Err(CoreError::handshake(format!(
                "Unexpected request: {} {} HTTP/1.{}",
                head.method, head.target, head.version
            )));
        }

        let path = head.target.split('?').next().unwrap_or_default();
        if path != self.config.path {
            return Err(CoreError::handshake(format!("Unknown path: {}", path)));
        }

        let host = head
            .header("host")
            .map(|h| h.split(':').next().unwrap_or(h))
            .unwrap_or_default();
        if !host.eq_ignore_ascii_case(&self.config.mimic_domain) {
            return Err(CoreError::handshake(format!("Unexpected host: {}", host)));
        }

        if !head.header_has_token("upgrade", "websocket")
            || !head.header_has_token("connection", "upgrade")
        {
            return Err(CoreError::handshake("Not a WebSocket upgrade"));
        }

        let key = head
            .header("sec-websocket-key")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CoreError::handshake("Missing Sec-WebSocket-Key"))?;

        if self.ctx.requires_auth() {
            let user_id = head
                .cookie("sid")
                .and_then(|sid| Uuid::parse_str(sid).ok())
                .ok_or_else(|| CoreError::unauthorized("Missing or malformed session id"))?;

            if !self.ctx.is_authorized(&user_id) {
                warn!(%user_id, "OTLS/WS user is not authorized");
                return Err(CoreError::unauthorized(format!(
                    "User {} is not authorized",
                    user_id
                )));
            }
        }

        Ok(key.to_string())
    }

    async fn run_session<S>(&self, ws: WebSocketStream<BufReader<S>>, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, mut source) = ws.split();
        let activity = Arc::new(Activity::new());

        let (message_tx, message_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(write_messages(sink, message_rx, activity.clone()));

        let (upstream_writer, upstream_task) = match &self.config.upstream {
            Some(addr) => {
                let (writer, task) = self.open_upstream(addr, message_tx.clone()).await?;
                debug!(%peer, upstream = %addr, "Relaying OTLS/WS session");
                (Some(writer), Some(task))
            }
            None => (None, None),
        };

        let result = self
            .read_loop(&mut source, &message_tx, upstream_writer, &activity)
            .await;

        if let Some(task) = upstream_task {
            task.abort();
        }
        drop(message_tx);
        if let Ok(Err(e)) = writer_task.await {
            debug!(%peer, "OTLS/WS writer finished with error: {}", e);
        }

        result
    }

    async fn open_upstream(
        &self,
        addr: &str,
        message_tx: mpsc::Sender<Message>,
    ) -> Result<(OwnedWriteHalf, JoinHandle<()>)> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            error!(upstream = %addr, "Failed to reach upstream: {}", e);
            CoreError::Io(e)
        })?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let task = tokio::spawn(pump_upstream(
            read_half,
            self.ctx.obfuscator.clone(),
            message_tx,
        ));

        Ok((write_half, task))
    }

    async fn read_loop<S>(
        &self,
        source: &mut WsSource<S>,
        message_tx: &mpsc::Sender<Message>,
        mut upstream: Option<OwnedWriteHalf>,
        activity: &Activity,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let remaining = self.idle_timeout.saturating_sub(activity.idle());
            if remaining.is_zero() {
                let _ = message_tx.send(close_message(CloseCode::Away)).await;
                return Err(CoreError::timeout(self.idle_timeout.as_millis() as u64));
            }

            let message = match timeout(remaining, source.next()).await {
                // Outbound traffic may have moved the deadline
                Err(_) => continue,
                Ok(None) => return Ok(()),
                Ok(Some(message)) => message?,
            };
            activity.touch();

            match message {
                Message::Binary(payload) => {
                    let data = self.ctx.obfuscator.deobfuscate_data(&payload)?;
                    self.ctx.kill_switch.record_heartbeat();

                    match upstream.as_mut() {
                        Some(writer) => writer.write_all(&data).await?,
                        None => {
                            let envelope = self.ctx.obfuscator.obfuscate_data(&data).await?;
                            send_message(message_tx, Message::Binary(envelope)).await?;
                        }
                    }
                }
                // Pings are answered by the codec
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => {
                    let _ = message_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                Message::Text(_) | Message::Frame(_) => {
                    let _ = message_tx.send(close_message(CloseCode::Unsupported)).await;
                    return Err(CoreError::protocol_violation(
                        "Only binary messages are accepted",
                    ));
                }
            }
        }
    }
}

async fn send_message(message_tx: &mpsc::Sender<Message>, message: Message) -> Result<()> {
    message_tx.send(message).await.map_err(|_| {
        CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "OTLS/WS writer closed",
        ))
    })
}

async fn write_messages<S>(
    mut sink: WsSink<S>,
    mut message_rx: mpsc::Receiver<Message>,
    activity: Arc<Activity>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = message_rx.recv().await {
        let closing = message.is_close();
        sink.send(message).await?;
        activity.touch();
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
    Ok(())
}

async fn pump_upstream(
    mut reader: OwnedReadHalf,
    obfuscator: Arc<Obfuscator>,
    message_tx: mpsc::Sender<Message>,
) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Upstream closed the connection");
                let _ = message_tx.send(close_message(CloseCode::Normal)).await;
                break;
            }
            Ok(n) => match obfuscator.obfuscate_data(&buf[..n]).await {
                Ok(envelope) => {
                    if message_tx.send(Message::Binary(envelope)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to obfuscate upstream data: {}", e);
                    break;
                }
            },
            Err(e) => {
                debug!("Upstream read failed: {}", e);
                let _ = message_tx.send(close_message(CloseCode::Away)).await;
                break;
            }
        }
    }
}

#[async_trait]
impl ObfuscatedProtocol for OtlsWsProtocol {
    fn name(&self) -> &'static str {
        "OTLS/WS"
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::OtlsWs
    }

    async fn handle_tcp_stream(&self, stream: TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        debug!(peer = %peer_addr, "OTLS/WS: handling incoming TCP stream");

        self.serve(stream, peer_addr).await
    }

    async fn handle_udp_packet(
        &self,
        _socket: &UdpSocket,
        _buf: &[u8],
        peer_addr: SocketAddr,
    ) -> Result<()> {
        error!(
            "OTLS/WS: received unexpected UDP packet from {}. This protocol is TCP-based.",
            peer_addr
        );
        Err(CoreError::UnsupportedTransport {
            protocol: self.name(),
            transport: TransportKind::Udp.as_str(),
        })
    }
}
