//! HezarDastan Core - obfuscated tunnel server
//!
//! This library provides the server runtime, the OTLS/WS and AOQUIC
//! protocols, traffic obfuscation, the kill switch and a tunnel client.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocols;
pub mod security;
pub mod server;
pub mod signals;

// Re-export commonly used types
pub use client::{TunnelClient, TunnelSession};
pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use protocols::{ObfuscatedProtocol, ProtocolType, TunnelConfig};
pub use server::{CoreServer, ServerStats, ShutdownHandle};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
