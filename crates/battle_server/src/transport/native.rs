//! Tokio socket backend.

use super::{bind_listener, frame, FrameReader, FrameWriter, Listener, Transport, TransportHandle};
use crate::error::TransportError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

/// Backend built on tokio's own TCP sockets.
#[derive(Debug, Default)]
pub struct NativeTransport;

impl NativeTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Box<dyn Listener>, TransportError> {
        let std_listener = bind_listener(addr)?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!("✅ Native listener bound on {}", listener.local_addr()?);
        Ok(Box::new(NativeListener { listener }))
    }
}

struct NativeListener {
    listener: TcpListener,
}

#[async_trait]
impl Listener for NativeListener {
    async fn accept(&mut self) -> io::Result<TransportHandle> {
        let (stream, remote_addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(TransportHandle::new(
            remote_addr,
            Box::new(StreamReader::new(read_half)),
            Box::new(StreamWriter::new(write_half)),
        ))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Frame reader over any async byte source.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> FrameReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        frame::read_frame(&mut self.inner).await
    }
}

/// Frame writer over any async byte sink.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> FrameWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        frame::write_frame(&mut self.inner, payload).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepts_and_exchanges_frames() {
        let transport = NativeTransport::new();
        let mut listener = transport
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            frame::write_frame(&mut stream, b"hello").await.unwrap();
            frame::read_frame(&mut stream).await.unwrap()
        });

        let mut handle = listener.accept().await.unwrap();
        assert_eq!(handle.reader.read_frame().await.unwrap(), Some(b"hello".to_vec()));
        handle.writer.write_frame(b"welcome").await.unwrap();

        assert_eq!(client.await.unwrap(), Some(b"welcome".to_vec()));
    }

    #[tokio::test]
    async fn listen_on_taken_port_is_a_bind_error() {
        let transport = NativeTransport::new();
        let first = transport
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let err = transport.listen(taken).await.err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }
}
