//! Transport layer abstraction.
//!
//! Two socket backends sit behind the [`Transport`] trait and are selected once,
//! when the server is constructed:
//!
//! * [`native::NativeTransport`] uses tokio's async sockets directly.
//! * [`reactor::ReactorTransport`] runs its own `mio` poll loop on a dedicated
//!   thread, with a socket manager tracking every raw stream.
//!
//! Both hand out [`TransportHandle`]s carrying a frame reader and a frame
//! writer, and both report listen failures from [`Transport::listen`], before
//! any connection is accepted.

pub mod frame;
pub mod native;
pub mod reactor;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use native::NativeTransport;
pub use reactor::ReactorTransport;

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame from the peer. `Ok(None)` means the peer closed the stream.
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> io::Result<()>;
}

/// A freshly accepted connection, split into its two halves.
pub struct TransportHandle {
    pub remote_addr: SocketAddr,
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl TransportHandle {
    pub fn new(
        remote_addr: SocketAddr,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
    ) -> Self {
        Self {
            remote_addr,
            reader,
            writer,
        }
    }

    /// Wrap any async byte stream, e.g. one end of `tokio::io::duplex`.
    pub fn from_stream<S>(stream: S, remote_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(
            remote_addr,
            Box::new(native::StreamReader::new(read_half)),
            Box::new(native::StreamWriter::new(write_half)),
        )
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A bound listening endpoint.
#[async_trait]
pub trait Listener: Send {
    /// Accept the next connection.
    async fn accept(&mut self) -> io::Result<TransportHandle>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// A socket backend.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bind and listen on `addr`. Errors here are listen faults.
    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError>;
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Native,
    Reactor,
}

impl TransportKind {
    pub fn build(self) -> Arc<dyn Transport> {
        match self {
            TransportKind::Native => Arc::new(NativeTransport::new()),
            TransportKind::Reactor => Arc::new(ReactorTransport::new()),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Native => f.write_str("native"),
            TransportKind::Reactor => f.write_str("reactor"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "tokio" => Ok(TransportKind::Native),
            "reactor" | "mio" => Ok(TransportKind::Reactor),
            other => Err(format!("unknown transport backend: {other}")),
        }
    }
}

/// Create a non-blocking listening socket on `addr`.
///
/// Shared by both backends so that bind semantics (address reuse, backlog)
/// are identical.
pub(crate) fn bind_listener(addr: SocketAddr) -> Result<StdTcpListener, TransportError> {
    let bind_err = |source: io::Error| TransportError::Bind { addr, source };

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!("native".parse::<TransportKind>().unwrap(), TransportKind::Native);
        assert_eq!("MIO".parse::<TransportKind>().unwrap(), TransportKind::Reactor);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Reactor.to_string(), "reactor");
    }

    #[test]
    fn second_bind_on_same_port_fails() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();
        let second = bind_listener(taken);
        assert!(matches!(second, Err(TransportError::Bind { .. })));
    }

    #[tokio::test]
    async fn handles_from_streams_exchange_frames() {
        let (a, b) = tokio::io::duplex(256);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut left = TransportHandle::from_stream(a, addr);
        let mut right = TransportHandle::from_stream(b, addr);

        left.writer.write_frame(b"challenge").await.unwrap();
        assert_eq!(
            right.reader.read_frame().await.unwrap(),
            Some(b"challenge".to_vec())
        );

        left.writer.close().await.unwrap();
        assert_eq!(right.reader.read_frame().await.unwrap(), None);
    }
}
