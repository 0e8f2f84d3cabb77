//! Client connection representation.
//!
//! A [`Connection`] is the registry-owned view of one client: its id, where it
//! came from, the queue feeding its writer task, and the battle it is seated
//! in, if any. The transport halves themselves live in the pump tasks.

use battle_events::{BattleId, ConnectionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::debug;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Messages for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Represents an individual client connection to the server.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    /// Distinguishes this connection from earlier holders of the same id
    serial: u64,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    outbound: mpsc::UnboundedSender<Outbound>,
    battle: RwLock<Option<BattleId>>,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
}

impl Connection {
    /// Creates a connection whose outbound frames go to `outbound`.
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            connected_at: SystemTime::now(),
            outbound,
            battle: RwLock::new(None),
            closed: AtomicBool::new(false),
            closed_signal: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Queue a frame for the client. Returns false once the writer is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    /// Ask the writer task to flush and close the transport.
    pub fn close(&self) {
        if self.outbound.send(Outbound::Close).is_err() {
            debug!("Connection {} writer already stopped", self.id);
        }
    }

    /// Flag the connection as torn down. Returns true for the first caller only.
    pub fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.closed_signal.send_replace(true);
        }
        first
    }

    /// Resolves once the connection has been marked closed.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut signal = self.closed_signal.subscribe();
        async move {
            let _ = signal.wait_for(|closed| *closed).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The battle this connection is seated in.
    pub async fn battle(&self) -> Option<BattleId> {
        self.battle.read().await.clone()
    }

    pub async fn set_battle(&self, battle: Option<BattleId>) {
        *self.battle.write().await = battle;
    }

    /// Clear the battle binding only if it still points at `battle`.
    pub async fn leave_battle(&self, battle: &BattleId) -> bool {
        let mut current = self.battle.write().await;
        if current.as_ref() == Some(battle) {
            *current = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: u32) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = "127.0.0.1:4000".parse().unwrap();
        (Connection::new(ConnectionId(id), addr, tx), rx)
    }

    #[tokio::test]
    async fn frames_stop_after_close() {
        let (conn, mut rx) = connection(0);
        assert!(conn.send(b"one".to_vec()));
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
        assert!(!conn.send(b"two".to_vec()));
        conn.close();

        assert_eq!(rx.recv().await, Some(Outbound::Frame(b"one".to_vec())));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn closed_future_resolves_after_mark() {
        let (conn, _rx) = connection(1);
        let waiter = conn.closed();
        conn.mark_closed();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap();
        // Subscribing after the fact resolves immediately.
        conn.closed().await;
    }

    #[tokio::test]
    async fn leave_battle_only_clears_matching_binding() {
        let (conn, _rx) = connection(3);
        let b1 = BattleId::from("b1");
        conn.set_battle(Some(b1.clone())).await;

        assert!(!conn.leave_battle(&BattleId::from("b2")).await);
        assert_eq!(conn.battle().await, Some(b1.clone()));
        assert!(conn.leave_battle(&b1).await);
        assert_eq!(conn.battle().await, None);
    }

    #[test]
    fn serials_are_unique() {
        let (a, _ra) = connection(0);
        let (b, _rb) = connection(0);
        assert_ne!(a.serial(), b.serial());
    }
}
