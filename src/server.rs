//! Server runtime: listeners, admission control and background tasks.

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::error::Result;
use crate::protocols::{
    AoQuicProtocol, ObfuscatedProtocol, OtlsWsProtocol, ProtocolContext, ProtocolType,
};
use crate::security::{KillSwitchManager, Obfuscator};

/// Snapshot of server counters
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStats {
    pub accepted_connections: u64,
    pub active_connections: usize,
    pub rejected_connections: u64,
    pub datagrams_received: u64,
    pub handler_errors: u64,
    pub started_at: DateTime<Utc>,
    pub uptime: Duration,
}

#[derive(Default)]
struct StatsCounters {
    accepted: AtomicU64,
    active: AtomicUsize,
    rejected: AtomicU64,
    datagrams: AtomicU64,
    handler_errors: AtomicU64,
}

/// Cloneable handle that stops a running server
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }
}

/// HezarDastan Core server
pub struct CoreServer {
    config: CoreConfig,
    tcp_listener: Option<TcpListener>,
    udp_socket: Option<Arc<UdpSocket>>,
    otls_ws: Option<Arc<OtlsWsProtocol>>,
    aoquic: Option<Arc<AoQuicProtocol>>,
    obfuscator: Arc<Obfuscator>,
    kill_switch: KillSwitchManager,
    stats: Arc<StatsCounters>,
    started_at: (Instant, DateTime<Utc>),
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl CoreServer {
    /// Validate the configuration and bind listeners for the enabled protocols
    pub async fn bind(config: CoreConfig) -> Result<Self> {
        config.validate()?;

        let obfuscator = Arc::new(Obfuscator::new(
            config.obfuscation.clone(),
            config.otls_ws.mimic_domain.clone(),
        ));
        let kill_switch = KillSwitchManager::new(config.kill_switch.enabled);
        let ctx = ProtocolContext::new(
            obfuscator.clone(),
            kill_switch.clone(),
            config.server.authorized_users.iter().copied(),
        );

        let (tcp_listener, otls_ws) = if config.server.is_enabled(ProtocolType::OtlsWs) {
            let listener = TcpListener::bind(&config.server.tcp_listen_addr).await?;
            info!("OTLS/WS listening on {}", listener.local_addr()?);
            let protocol = OtlsWsProtocol::new(
                config.otls_ws.clone(),
                config.server.connection_timeout(),
                ctx.clone(),
            );
            (Some(listener), Some(Arc::new(protocol)))
        } else {
            (None, None)
        };

        let (udp_socket, aoquic) = if config.server.is_enabled(ProtocolType::AoQuic) {
            let socket = Arc::new(UdpSocket::bind(&config.server.udp_listen_addr).await?);
            info!("AOQUIC listening on {}", socket.local_addr()?);
            let protocol = AoQuicProtocol::new(config.aoquic.clone(), ctx);
            protocol.attach_socket(socket.clone());
            (Some(socket), Some(Arc::new(protocol)))
        } else {
            (None, None)
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            tcp_listener,
            udp_socket,
            otls_ws,
            aoquic,
            obfuscator,
            kill_switch,
            stats: Arc::new(StatsCounters::default()),
            started_at: (Instant::now(), Utc::now()),
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn local_tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.udp_socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn kill_switch(&self) -> KillSwitchManager {
        self.kill_switch.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown_tx.clone(),
        }
    }

    /// Function returning the current counters; usable after `run` takes the
    /// server
    pub fn stats_reader(&self) -> impl Fn() -> ServerStats + Send + Sync + 'static {
        let stats = self.stats.clone();
        let started_at = self.started_at;
        move || snapshot(&stats, started_at)
    }

    pub fn stats(&self) -> ServerStats {
        snapshot(&self.stats, self.started_at)
    }

    /// Serve until shutdown is requested
    pub async fn run(self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if let (Some(listener), Some(protocol)) = (self.tcp_listener, self.otls_ws) {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                protocol,
                Arc::new(Semaphore::new(self.config.server.max_connections)),
                self.stats.clone(),
                shutdown_signal(&shutdown_tx),
            )));
        }

        if let (Some(socket), Some(protocol)) = (self.udp_socket, self.aoquic) {
            tasks.push(tokio::spawn(datagram_loop(
                socket,
                protocol.clone(),
                self.config.aoquic.max_datagram_size,
                self.stats.clone(),
                shutdown_signal(&shutdown_tx),
            )));

            let sweep_interval =
                (self.config.aoquic.session_idle_timeout() / 4).max(Duration::from_millis(250));
            let shutdown = shutdown_signal(&shutdown_tx);
            tasks.push(tokio::spawn(async move {
                protocol.run_sweeper(sweep_interval, shutdown).await;
            }));
        }

        {
            let kill_switch = self.kill_switch.clone();
            let interval = Duration::from_millis(self.config.kill_switch.check_interval_ms);
            let timeout = Duration::from_millis(self.config.kill_switch.heartbeat_timeout_ms);
            let shutdown = shutdown_signal(&shutdown_tx);
            tasks.push(tokio::spawn(async move {
                kill_switch
                    .run_health_monitor(interval, timeout, shutdown)
                    .await;
            }));
        }

        {
            let obfuscator = self.obfuscator.clone();
            let interval = Duration::from_secs(self.config.obfuscation.mutation_interval_secs);
            let shutdown = shutdown_signal(&shutdown_tx);
            tasks.push(tokio::spawn(async move {
                obfuscator.run_mutation_cycle(interval, shutdown).await;
            }));
        }

        info!("HezarDastan Core server running");

        for task in tasks {
            if let Err(e) = task.await {
                error!("Server task failed: {}", e);
            }
        }

        let stats = snapshot(&self.stats, self.started_at);
        info!(
            accepted = stats.accepted_connections,
            rejected = stats.rejected_connections,
            datagrams = stats.datagrams_received,
            handler_errors = stats.handler_errors,
            "Server stopped after {:?}",
            stats.uptime
        );

        Ok(())
    }
}

fn snapshot(stats: &StatsCounters, started_at: (Instant, DateTime<Utc>)) -> ServerStats {
    ServerStats {
        accepted_connections: stats.accepted.load(Ordering::Relaxed),
        active_connections: stats.active.load(Ordering::Relaxed),
        rejected_connections: stats.rejected.load(Ordering::Relaxed),
        datagrams_received: stats.datagrams.load(Ordering::Relaxed),
        handler_errors: stats.handler_errors.load(Ordering::Relaxed),
        started_at: started_at.1,
        uptime: started_at.0.elapsed(),
    }
}

/// Receiver that also observes a shutdown requested before `run`
fn shutdown_signal(sender: &watch::Sender<bool>) -> watch::Receiver<bool> {
    let mut receiver = sender.subscribe();
    receiver.mark_changed();
    receiver
}

fn shutdown_requested(
    changed: std::result::Result<(), watch::error::RecvError>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Arc<dyn ObfuscatedProtocol>,
    limiter: Arc<Semaphore>,
    stats: Arc<StatsCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                        continue;
                    }
                };

                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(%peer, "Connection limit reached, dropping connection");
                        drop(stream);
                        continue;
                    }
                };

                stats.accepted.fetch_add(1, Ordering::Relaxed);
                stats.active.fetch_add(1, Ordering::Relaxed);

                let protocol = protocol.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = protocol.handle_tcp_stream(stream).await {
                        if e.is_disconnect() {
                            debug!(%peer, "{} peer went away: {}", protocol.name(), e);
                        } else {
                            stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(%peer, "{} connection ended with error: {}", protocol.name(), e);
                        }
                    }
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                });
            }
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
            }
        }
    }

    debug!("TCP accept loop stopped");
}

async fn datagram_loop(
    socket: Arc<UdpSocket>,
    protocol: Arc<AoQuicProtocol>,
    max_datagram_size: usize,
    stats: Arc<StatsCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_datagram_size];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive UDP datagram: {}", e);
                        continue;
                    }
                };
                stats.datagrams.fetch_add(1, Ordering::Relaxed);

                let datagram = buf[..n].to_vec();
                let socket = socket.clone();
                let protocol = protocol.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    if let Err(e) = protocol.handle_udp_packet(&socket, &datagram, peer).await {
                        stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, "{} datagram rejected: {}", protocol.name(), e);
                    }
                });
            }
            changed = shutdown.changed() => {
                if shutdown_requested(changed, &shutdown) {
                    break;
                }
            }
        }
    }

    debug!("UDP receive loop stopped");
}
