//! Server configuration types and defaults.
//!
//! This module contains the configuration structure used to initialize the
//! battle server. The binary builds it from a TOML file plus CLI overrides.

use crate::transport::TransportKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure for the battle server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to listen on; the port is supplied to `start`
    pub bind_address: IpAddr,

    /// Default port used by the binary
    pub port: u16,

    /// Abort a battle the instant either side disconnects
    pub close_on_disconnect: bool,

    /// Backing store selected at startup
    pub backing_store: String,

    /// Backing stores that may be selected; empty accepts any name
    pub available_stores: Vec<String>,

    /// Socket backend, chosen once at construction
    pub transport: TransportKind,

    /// Size of the connection id space
    pub max_connections: u32,

    /// How long a vacated battle seat waits for a rejoin when
    /// `close_on_disconnect` is off
    pub disconnect_grace: Duration,

    /// How long a force-terminated battle task may take to stop before it is
    /// cancelled outright
    pub terminate_grace: Duration,

    /// Directory path where plugin libraries are stored
    pub plugin_directory: PathBuf,

    /// Plugins loaded at startup, by name, in this order
    pub auto_load: Vec<String>,
}

impl ServerConfig {
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.bind_address, port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 5096,
            close_on_disconnect: true,
            backing_store: "sqlite".to_string(),
            available_stores: Vec::new(),
            transport: TransportKind::Native,
            max_connections: 1000,
            disconnect_grace: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(2),
            plugin_directory: PathBuf::from("plugins"),
            auto_load: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5096);
        assert!(config.close_on_disconnect);
        assert_eq!(config.transport, TransportKind::Native);
        assert_eq!(config.socket_addr(0).ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
