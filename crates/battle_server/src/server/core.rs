//! Core battle server implementation.
//!
//! This module contains the [`BattleServer`] façade. It composes the transport,
//! the connection registry, the plugin manager and the battle dispatcher, and
//! exposes the handful of operations operator tooling needs.

use super::pump::{self, TransportEvent, TransportEventKind};
use crate::battle::{
    BattleConclusion, BattleDispatcher, BattleHandle, BattleRequest, BattleSummary, RulesEngine,
};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::{BattleError, RegistryError, ServerError};
use crate::store::BackingStore;
use crate::transport::{Listener, Transport, TransportHandle};
use battle_events::{
    AbortReason, BattleId, BattlePlayer, ChallengeInfo, ConnectionId, DisconnectReason,
    ServerEvent, Side, TeamBattle,
};
use plugin_system::{
    platform_library_name, DispatchReport, DylibLoader, PluginInfo, PluginLoader, PluginManager,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent fault does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Counters reported to operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: usize,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub battles_running: usize,
    pub battles_completed: u64,
    pub battles_aborted: u64,
    pub plugins: usize,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
}

/// Receivers consumed by the acceptor loop when the server starts.
struct LoopInputs {
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    conclusions: mpsc::UnboundedReceiver<BattleConclusion>,
}

/// The battle server façade.
///
/// Owns the registries, never the connections or battles themselves:
/// the [`ConnectionRegistry`] owns connections, the [`BattleDispatcher`] owns
/// battle sessions and the [`PluginManager`] owns plugins.
///
/// # Control flow
///
/// A single acceptor task accepts connections, applies transport events
/// (peer closed, I/O error) and records battle conclusions. Each battle and
/// each connection's reads and writes run in their own tasks.
pub struct BattleServer {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    plugins: Arc<PluginManager>,
    dispatcher: Arc<BattleDispatcher>,
    store: BackingStore,

    close_on_disconnect: AtomicBool,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    loop_inputs: Mutex<Option<LoopInputs>>,
    shutdown_sender: broadcast::Sender<()>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    stopping: AtomicBool,
    counters: Counters,
}

impl BattleServer {
    /// Creates a server with the transport named in `config` and a plugin
    /// manager loading shared libraries.
    pub fn new(config: ServerConfig, engine: Arc<dyn RulesEngine>) -> Arc<Self> {
        let transport = config.transport.build();
        Self::with_components(config, engine, transport, Arc::new(DylibLoader))
    }

    /// Creates a server from explicit components.
    pub fn with_components(
        config: ServerConfig,
        engine: Arc<dyn RulesEngine>,
        transport: Arc<dyn Transport>,
        loader: Arc<dyn PluginLoader>,
    ) -> Arc<Self> {
        let plugins = Arc::new(PluginManager::new(loader));
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let (conclusion_tx, conclusion_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(BattleDispatcher::new(
            engine,
            plugins.clone(),
            conclusion_tx,
            config.terminate_grace,
            config.disconnect_grace,
        ));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_sender, _) = broadcast::channel(1);
        let store = BackingStore::new(config.backing_store.clone(), config.available_stores.clone());

        Arc::new(Self {
            close_on_disconnect: AtomicBool::new(config.close_on_disconnect),
            config,
            transport,
            registry,
            plugins,
            dispatcher,
            store,
            transport_events: event_tx,
            loop_inputs: Mutex::new(Some(LoopInputs {
                transport_events: event_rx,
                conclusions: conclusion_rx,
            })),
            shutdown_sender,
            acceptor: Mutex::new(None),
            local_addr: Mutex::new(None),
            stopping: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    /// Bind the transport to `port` and start accepting.
    ///
    /// Returns the bound address once listening. A bind failure is returned
    /// here, before any connection is accepted. Port 0 picks a free port.
    pub async fn start(
        self: &Arc<Self>,
        port: u16,
        close_on_disconnect: bool,
    ) -> Result<SocketAddr, ServerError> {
        let inputs = self
            .loop_inputs
            .lock()
            .await
            .take()
            .ok_or_else(|| ServerError::Internal("server already started".to_string()))?;

        self.close_on_disconnect
            .store(close_on_disconnect, Ordering::SeqCst);

        let addr = self.config.socket_addr(port);
        info!("🚀 Starting battle server on {} ({} transport)", addr, self.transport.name());

        let listener = match self.transport.listen(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to listen on {}: {}", addr, e);
                *self.loop_inputs.lock().await = Some(inputs);
                return Err(e.into());
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(e.to_string()))?;
        *self.local_addr.lock().await = Some(local_addr);

        info!(
            "⚔️ Battles {} when a player disconnects",
            if close_on_disconnect { "abort" } else { "wait for a rejoin" }
        );

        let shutdown = self.shutdown_sender.subscribe();
        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            server.run_acceptor(listener, inputs, shutdown).await;
        });
        *self.acceptor.lock().await = Some(task);

        info!("✅ Listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn run_acceptor(
        self: Arc<Self>,
        mut listener: Box<dyn Listener>,
        inputs: LoopInputs,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let LoopInputs {
            mut transport_events,
            mut conclusions,
        } = inputs;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(handle) => {
                        if let Err(e) = self.on_new_connection(handle).await {
                            warn!("Connection not admitted: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                Some(conclusion) = conclusions.recv() => self.record_conclusion(conclusion),
            }
        }

        drop(listener);
        info!("Acceptor stopped");
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        let Some(conn) = self.registry.lookup(event.id).await else {
            debug!("Transport event for released connection {}", event.id);
            return;
        };
        if conn.serial() != event.serial {
            debug!("Stale transport event for reused connection id {}", event.id);
            return;
        }
        let reason = match event.kind {
            TransportEventKind::Closed => DisconnectReason::ClientClosed,
            TransportEventKind::Error(e) => DisconnectReason::TransportError(e),
        };
        self.teardown(&conn, reason).await;
    }

    fn record_conclusion(&self, conclusion: BattleConclusion) {
        let counter = if conclusion.result.is_completed() {
            &self.counters.completed
        } else {
            &self.counters.aborted
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Battle {} concluded after {:?}",
            conclusion.battle_id, conclusion.duration
        );
    }

    /// Admit a freshly accepted connection.
    ///
    /// Allocates an id, binds the connection, starts its I/O tasks and tells
    /// plugins about it. A plugin veto closes the connection again.
    pub async fn on_new_connection(
        &self,
        handle: TransportHandle,
    ) -> Result<ConnectionId, ServerError> {
        let TransportHandle {
            remote_addr,
            reader,
            mut writer,
        } = handle;

        let id = match self.registry.allocate().await {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejecting connection from {}: {}", remote_addr, e);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                if let Err(close_err) = writer.close().await {
                    debug!("Closing rejected connection failed: {}", close_err);
                }
                return Err(e.into());
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(id, remote_addr, outbound_tx));
        if let Err(e) = self.registry.bind(conn.clone()).await {
            self.registry.release(id).await;
            return Err(e.into());
        }

        pump::spawn_writer(
            id,
            conn.serial(),
            writer,
            outbound_rx,
            self.transport_events.clone(),
        );
        pump::spawn_reader(
            conn.clone(),
            reader,
            self.dispatcher.clone(),
            self.transport_events.clone(),
        );

        info!("🔗 Connection {} from {}", id, remote_addr);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let report = self
            .dispatch(ServerEvent::NewConnection { id, remote_addr })
            .await;

        if let Some((plugin, reason)) = report.veto {
            info!("🚫 Plugin {} rejected connection {}: {}", plugin, id, reason);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.teardown(&conn, DisconnectReason::Rejected(reason.clone()))
                .await;
            return Err(ServerError::Rejected { id, plugin, reason });
        }

        Ok(id)
    }

    /// Tear down connection `id` after a transport error.
    ///
    /// Its battle is force-terminated (or its seat vacated when battles
    /// survive disconnects), its id is released, and plugins are told the
    /// connection closed, in that order.
    pub async fn on_error(
        &self,
        id: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), ServerError> {
        let conn = self
            .registry
            .lookup(id)
            .await
            .ok_or(RegistryError::NotFound(id))?;
        self.teardown(&conn, reason).await;
        Ok(())
    }

    /// Runs at most once per connection.
    async fn teardown(&self, conn: &Arc<Connection>, reason: DisconnectReason) -> bool {
        if !conn.mark_closed() {
            return false;
        }
        let id = conn.id();

        if let DisconnectReason::TransportError(error) = &reason {
            warn!("Connection {} failed: {}", id, error);
            self.dispatch(ServerEvent::ConnectionError {
                id,
                error: error.clone(),
            })
            .await;
        }

        if let Some(battle_id) = self.dispatcher.battle_of(conn).await {
            let keep_battle = !self.close_on_disconnect.load(Ordering::SeqCst)
                && !matches!(reason, DisconnectReason::Shutdown);
            if keep_battle {
                self.dispatcher.vacate_seat(conn).await;
            } else {
                self.dispatcher
                    .force_terminate(&battle_id, AbortReason::Disconnected(id))
                    .await;
            }
        }

        conn.close();
        self.registry.release_connection(conn).await;
        info!("👋 Connection {} closed: {}", id, reason);

        self.dispatch(ServerEvent::ConnectionClosed { id, reason }).await;
        true
    }

    /// Validate a battle request and hand it to the dispatcher.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_battle(
        &self,
        server_id: ConnectionId,
        battle_id: impl Into<BattleId>,
        player_a: BattlePlayer,
        player_b: BattlePlayer,
        challenge: ChallengeInfo,
        team_a: TeamBattle,
        team_b: TeamBattle,
    ) -> Result<BattleHandle, ServerError> {
        let battle_id = battle_id.into();

        if battle_id.as_str().trim().is_empty() {
            return Err(BattleError::Invalid("battle id is empty".to_string()).into());
        }
        if challenge.tier.trim().is_empty() {
            return Err(BattleError::Invalid("challenge has no tier".to_string()).into());
        }
        for (side, team) in [(Side::A, &team_a), (Side::B, &team_b)] {
            if team.is_empty() || team.len() > TeamBattle::MAX_MEMBERS {
                return Err(BattleError::Invalid(format!(
                    "side {side} team has {} members (1 to {} allowed)",
                    team.len(),
                    TeamBattle::MAX_MEMBERS
                ))
                .into());
            }
        }
        if player_a.connection == player_b.connection {
            return Err(BattleError::SamePlayer(player_a.connection).into());
        }
        if self.registry.lookup(server_id).await.is_none() {
            return Err(BattleError::ConnectionNotFound(server_id).into());
        }
        let conn_a = self.live_connection(player_a.connection).await?;
        let conn_b = self.live_connection(player_b.connection).await?;

        let request = BattleRequest {
            server_id,
            battle_id,
            players: [player_a, player_b],
            challenge,
            teams: [team_a, team_b],
        };
        let backing_store = self.store.current().await;
        let handle = self
            .dispatcher
            .start_battle(request, [conn_a, conn_b], backing_store)
            .await?;
        Ok(handle)
    }

    async fn live_connection(&self, id: ConnectionId) -> Result<Arc<Connection>, BattleError> {
        match self.registry.lookup(id).await {
            Some(conn) if !conn.is_closed() => Ok(conn),
            _ => Err(BattleError::ConnectionNotFound(id)),
        }
    }

    /// Seat connection `id` on the vacant `side` of a running battle.
    pub async fn rejoin_battle(
        &self,
        battle_id: &BattleId,
        side: Side,
        id: ConnectionId,
    ) -> Result<(), ServerError> {
        let conn = self.live_connection(id).await?;
        self.dispatcher.rejoin(battle_id, side, conn).await?;
        Ok(())
    }

    /// Abort a battle on operator request. Returns false if it already ended.
    pub async fn terminate_battle(&self, battle_id: &BattleId, why: &str) -> bool {
        self.dispatcher
            .force_terminate(battle_id, AbortReason::Administrative(why.to_string()))
            .await
    }

    /// Switch the backing store. Running battles keep the store they started
    /// with.
    pub async fn change_backing_store(&self, name: &str) -> Result<String, ServerError> {
        let previous = self.store.swap(name).await?;
        let current = self.store.current().await;
        info!("🗄️ Backing store changed: {} -> {}", previous, current);

        self.dispatch(ServerEvent::BackingStoreChanged {
            previous: previous.clone(),
            current,
        })
        .await;
        Ok(previous)
    }

    pub async fn backing_store(&self) -> String {
        self.store.current().await
    }

    /// Load the plugin at `path`. Returns the name it registered under.
    pub async fn load_plugin(&self, path: impl AsRef<Path>) -> Result<String, ServerError> {
        let path = path.as_ref();
        match self.plugins.load(path).await {
            Ok(name) => {
                info!("🔌 Plugin {} loaded from {}", name, path.display());
                Ok(name)
            }
            Err(e) => {
                error!("Failed to load plugin from {}: {}", path.display(), e);
                Err(e.into())
            }
        }
    }

    pub async fn unload_plugin(&self, name: &str) -> Result<(), ServerError> {
        match self.plugins.unload(name).await {
            Ok(()) => {
                info!("🔌 Plugin {} unloaded", name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to unload plugin {}: {}", name, e);
                Err(e.into())
            }
        }
    }

    /// Load every plugin named in the configuration's auto-load list.
    ///
    /// Failures are logged and skipped. Returns how many loaded.
    pub async fn load_configured_plugins(&self) -> usize {
        info!(
            "🔌 Loading plugins from: {}",
            self.config.plugin_directory.display()
        );
        let mut loaded = 0;
        for name in &self.config.auto_load {
            let path = self
                .config
                .plugin_directory
                .join(platform_library_name(name));
            if self.load_plugin(&path).await.is_ok() {
                loaded += 1;
            }
        }

        if loaded > 0 {
            info!(
                "🎉 Successfully loaded {} plugin(s): {:?}",
                loaded,
                self.plugins.plugin_names().await
            );
        } else {
            info!("📭 No plugins loaded");
        }
        loaded
    }

    /// Stop accepting, abort every battle, close every connection and shut
    /// down plugins. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🧹 Performing server cleanup...");

        let _ = self.shutdown_sender.send(());
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            if let Err(e) = acceptor.await {
                error!("Acceptor task failed: {}", e);
            }
        }

        let aborted = self.dispatcher.terminate_all(AbortReason::Shutdown).await;
        if aborted > 0 {
            info!("Aborted {} running battle(s)", aborted);
        }

        for conn in self.registry.connections().await {
            self.teardown(&conn, DisconnectReason::Shutdown).await;
        }

        self.plugins.shutdown_all().await;
        info!("✅ Server cleanup completed");
    }

    async fn dispatch(&self, event: ServerEvent) -> DispatchReport {
        let report = self.plugins.dispatch(&event).await;
        for (plugin, e) in &report.failed {
            warn!("Plugin {} failed handling {}: {}", plugin, event.kind(), e);
        }
        report
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.registry.len().await,
            connections_accepted: self.counters.accepted.load(Ordering::Relaxed),
            connections_rejected: self.counters.rejected.load(Ordering::Relaxed),
            battles_running: self.dispatcher.running_count().await,
            battles_completed: self.counters.completed.load(Ordering::Relaxed),
            battles_aborted: self.counters.aborted.load(Ordering::Relaxed),
            plugins: self.plugins.plugin_count().await,
        }
    }

    /// Live connections, ordered by id.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.connections().await
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.lookup(id).await
    }

    pub async fn battles(&self) -> Vec<BattleSummary> {
        self.dispatcher.battles().await
    }

    pub async fn is_battle_running(&self, battle_id: &BattleId) -> bool {
        self.dispatcher.is_running(battle_id).await
    }

    pub async fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins.all_plugin_info().await
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
