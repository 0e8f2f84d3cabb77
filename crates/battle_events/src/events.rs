//! Events the server delivers to every loaded plugin.

use crate::types::{BattleId, BattlePlayer, BattleResult, ChallengeInfo, ConnectionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The peer closed the stream
    ClientClosed,
    /// Read or write on the socket failed
    TransportError(String),
    /// A plugin vetoed the connection
    Rejected(String),
    /// Closed by an operator
    Administrative,
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientClosed => f.write_str("client closed the connection"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::Rejected(why) => write!(f, "rejected: {why}"),
            DisconnectReason::Administrative => f.write_str("closed by operator"),
            DisconnectReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Server occurrences routed through the plugin manager.
///
/// Delivery is synchronous and in load order: the emitter resumes only after
/// every plugin has seen the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    NewConnection {
        id: ConnectionId,
        remote_addr: SocketAddr,
    },
    ConnectionError {
        id: ConnectionId,
        error: String,
    },
    ConnectionClosed {
        id: ConnectionId,
        reason: DisconnectReason,
    },
    BattleStarted {
        battle_id: BattleId,
        server_id: ConnectionId,
        players: [BattlePlayer; 2],
        challenge: ChallengeInfo,
    },
    BattleEnded {
        battle_id: BattleId,
        result: BattleResult,
    },
    BackingStoreChanged {
        previous: String,
        current: String,
    },
}

impl ServerEvent {
    /// Short stable name, used in logs and plugin filters.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::NewConnection { .. } => "new_connection",
            ServerEvent::ConnectionError { .. } => "connection_error",
            ServerEvent::ConnectionClosed { .. } => "connection_closed",
            ServerEvent::BattleStarted { .. } => "battle_started",
            ServerEvent::BattleEnded { .. } => "battle_ended",
            ServerEvent::BackingStoreChanged { .. } => "backing_store_changed",
        }
    }

    /// Only a new connection can be vetoed.
    pub fn is_vetoable(&self) -> bool {
        matches!(self, ServerEvent::NewConnection { .. })
    }
}
