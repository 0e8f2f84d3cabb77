//! # Battle Server
//!
//! Connection and session lifecycle management for a real-time, turn-based
//! battle server. The crate accepts client connections, gives each one a
//! dense id, pairs connections into battles that each run in their own task,
//! and tells loaded plugins about everything that happens along the way.
//!
//! The battle rules themselves are not here. They sit behind the
//! [`RulesEngine`] trait and are consumed as an opaque stream of steps.
//!
//! ## Architecture Overview
//!
//! * **Transport** ([`transport`]) - two interchangeable socket backends,
//!   tokio-native and a `mio` reactor, behind one [`Transport`] trait
//! * **Connection Registry** ([`ConnectionRegistry`]) - allocates ids
//!   lowest-free-first and owns every live [`Connection`]
//! * **Plugin Manager** ([`plugin_system::PluginManager`]) - ordered,
//!   isolated event delivery to runtime-loaded plugins
//! * **Battle Dispatcher** ([`BattleDispatcher`]) - one task per battle,
//!   with exactly-once termination
//! * **Server Façade** ([`BattleServer`]) - the acceptor loop and the
//!   operations operator tooling calls
//!
//! ### Connection lifecycle
//!
//! 1. The transport accepts a socket and hands over a [`TransportHandle`]
//! 2. The façade allocates an id, binds a [`Connection`] and starts its I/O tasks
//! 3. Plugins receive `new_connection` and may veto it
//! 4. On a transport error the connection's battle is aborted, its id is
//!    released, and plugins receive `connection_closed`
//!
//! ## Example
//!
//! ```rust,no_run
//! use battle_server::{create_server_with_config, ServerConfig};
//!
//! # async fn run() -> Result<(), battle_server::ServerError> {
//! let server = create_server_with_config(ServerConfig::default());
//! server.load_configured_plugins().await;
//! let addr = server.start(5096, true).await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod battle;
pub mod config;
pub mod connection;
pub mod error;
pub mod server;
pub mod store;
pub mod transport;
pub mod utils;

pub use battle::{
    BattleConclusion, BattleDispatcher, BattleHandle, BattleRequest, BattleSetup, BattleStep,
    BattleSummary, EngineError, PlayerInput, Recipient, RelayEngine, RulesEngine, SessionState,
};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionRegistry};
pub use error::{BattleError, RegistryError, ServerError, StoreError, TransportError};
pub use server::{BattleServer, ServerStats};
pub use transport::{Transport, TransportHandle, TransportKind};
pub use utils::{create_server, create_server_with_config};
