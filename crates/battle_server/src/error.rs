//! Error types for the battle server.
//!
//! Each component has its own error enum; [`ServerError`] is what the façade
//! returns and wraps all of them.

use battle_events::{BattleId, ConnectionId, PluginError};
use std::net::SocketAddr;

/// Connection registry failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Every id below the configured limit is live
    #[error("connection id space exhausted ({limit} live connections)")]
    Exhausted { limit: u32 },
    #[error("connection id {0} is already bound")]
    AlreadyBound(ConnectionId),
    #[error("connection id {0} was not allocated")]
    NotAllocated(ConnectionId),
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
}

/// Battle dispatcher failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BattleError {
    #[error("battle {0} already exists")]
    DuplicateBattle(BattleId),
    #[error("connection {connection} is already in battle {battle}")]
    AlreadyBattling {
        connection: ConnectionId,
        battle: BattleId,
    },
    #[error("connection {0} is not live")]
    ConnectionNotFound(ConnectionId),
    #[error("connection {0} cannot battle itself")]
    SamePlayer(ConnectionId),
    #[error("battle {0} not found")]
    NotFound(BattleId),
    #[error("invalid battle request: {0}")]
    Invalid(String),
}

/// Transport layer failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening socket could not be set up
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backing store selection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown backing store: {0}")]
    Unknown(String),
    #[error("backing store name cannot be empty")]
    EmptyName,
}

/// Errors returned by the server façade.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related error (binding, accepting)
    #[error("Network error: {0}")]
    Network(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Battle(#[from] BattleError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A plugin vetoed the connection
    #[error("connection {id} rejected by plugin {plugin}: {reason}")]
    Rejected {
        id: ConnectionId,
        plugin: String,
        reason: String,
    },
    /// Internal server error (invalid state, lifecycle misuse)
    #[error("Internal error: {0}")]
    Internal(String),
}
