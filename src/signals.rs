//! Signal handling for graceful shutdown

use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::server::ShutdownHandle;

/// Wait for a shutdown signal (SIGINT, SIGTERM)
pub async fn wait_for_shutdown() -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();

    info!("Signal handler installed, waiting for shutdown signal...");

    while let Some(signal) = signals.next().await {
        match signal {
            SIGINT => {
                info!("Received SIGINT (Ctrl+C)");
                break;
            }
            SIGTERM => {
                info!("Received SIGTERM");
                break;
            }
            _ => {
                debug!("Received unknown signal: {}", signal);
            }
        }
    }

    handle.close();
    Ok(())
}

/// Stop the server once `signal` fires. If the signal source fails the
/// server keeps running.
pub async fn shutdown_on<F>(signal: F, shutdown: ShutdownHandle)
where
    F: Future<Output = Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received, stopping server...");
            shutdown.shutdown();
        }
        Err(e) => {
            warn!("Signal handling unavailable, server keeps running: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::CoreError;
    use crate::server::CoreServer;

    async fn handle() -> ShutdownHandle {
        let mut config = CoreConfig::default();
        config.server.tcp_listen_addr = "127.0.0.1:0".to_string();
        config.server.udp_listen_addr = "127.0.0.1:0".to_string();
        CoreServer::bind(config).await.unwrap().shutdown_handle()
    }

    #[tokio::test]
    async fn test_signal_stops_server() {
        let shutdown = handle().await;
        shutdown_on(async { Ok(()) }, shutdown.clone()).await;
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_failed_signal_setup_keeps_server_running() {
        let shutdown = handle().await;
        shutdown_on(
            async { Err(CoreError::other("signal registration failed")) },
            shutdown.clone(),
        )
        .await;
        assert!(!shutdown.is_shutdown());
    }
}
