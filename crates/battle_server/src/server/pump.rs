//! Per-connection I/O tasks.
//!
//! Each accepted connection gets a reader task feeding the battle dispatcher
//! and a writer task draining the connection's outbound queue. Neither task
//! tears anything down itself: they report what happened to the acceptor loop
//! as a [`TransportEvent`].

use crate::battle::BattleDispatcher;
use crate::connection::{Connection, Outbound};
use crate::transport::{FrameReader, FrameWriter};
use battle_events::ConnectionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What happened on a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// The peer closed the stream
    Closed,
    /// Reading or writing failed
    Error(String),
}

/// A per-connection transport event, tagged with the connection's serial so
/// events for an id that has since been reused are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub id: ConnectionId,
    pub serial: u64,
    pub kind: TransportEventKind,
}

pub(crate) fn spawn_reader(
    conn: Arc<Connection>,
    mut reader: Box<dyn FrameReader>,
    dispatcher: Arc<BattleDispatcher>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let closed = conn.closed();
        tokio::pin!(closed);

        let kind = loop {
            let read = tokio::select! {
                _ = &mut closed => return,
                read = reader.read_frame() => read,
            };

            match read {
                Ok(Some(frame)) => {
                    trace!("Connection {} sent {} bytes", conn.id(), frame.len());
                    if !dispatcher.forward_input(&conn, frame).await {
                        debug!("Connection {} is not in a battle; frame dropped", conn.id());
                    }
                }
                Ok(None) => break TransportEventKind::Closed,
                Err(e) => break TransportEventKind::Error(e.to_string()),
            }
        };

        let _ = events.send(TransportEvent {
            id: conn.id(),
            serial: conn.serial(),
            kind,
        });
    })
}

pub(crate) fn spawn_writer(
    id: ConnectionId,
    serial: u64,
    mut writer: Box<dyn FrameWriter>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.write_frame(&frame).await {
                        let _ = events.send(TransportEvent {
                            id,
                            serial,
                            kind: TransportEventKind::Error(e.to_string()),
                        });
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }

        if let Err(e) = writer.close().await {
            debug!("Closing connection {} failed: {}", id, e);
        }
    })
}
