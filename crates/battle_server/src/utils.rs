//! Convenience constructors.

use crate::battle::RelayEngine;
use crate::config::ServerConfig;
use crate::server::BattleServer;
use std::sync::Arc;

/// A server with default configuration and the relay engine.
pub fn create_server() -> Arc<BattleServer> {
    create_server_with_config(ServerConfig::default())
}

/// A server with `config` and the relay engine.
pub fn create_server_with_config(config: ServerConfig) -> Arc<BattleServer> {
    BattleServer::new(config, Arc::new(RelayEngine))
}
